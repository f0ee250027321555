//! Model configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::GraphConfig;

/// Options forwarded to every ST-GCN block
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockOptions {
    /// Dropout rate after the temporal convolution
    pub dropout: f32,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self { dropout: 0.0 }
    }
}

impl BlockOptions {
    /// Same options with dropout stripped, used for the input block
    pub fn without_dropout(&self) -> Self {
        Self { dropout: 0.0 }
    }
}

/// Complete multi-view model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Coordinate channels per joint (x, y, confidence)
    pub in_channels: usize,

    /// Number of action classes
    pub num_class: usize,

    /// Skeleton topology
    pub graph: GraphConfig,

    /// Learn a multiplicative mask over the adjacency for every block
    pub edge_importance_weighting: bool,

    /// Temporal kernel size of every block, must be odd
    pub temporal_kernel_size: usize,

    /// Pass-through block options
    pub block: BlockOptions,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_class: 60,
            graph: GraphConfig::default(),
            edge_importance_weighting: true,
            temporal_kernel_size: 9,
            block: BlockOptions::default(),
        }
    }
}

impl ModelConfig {
    /// Load configuration from file, with `SKELVIEW_` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("SKELVIEW")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("SKELVIEW")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::InvalidConfig("in_channels must be positive".into()));
        }
        if self.num_class == 0 {
            return Err(Error::InvalidConfig("num_class must be positive".into()));
        }
        if self.temporal_kernel_size % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "temporal_kernel_size must be odd, got {}",
                self.temporal_kernel_size
            )));
        }
        if !(0.0..1.0).contains(&self.block.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.block.dropout
            )));
        }
        if self.graph.dilation == 0 {
            return Err(Error::InvalidConfig("graph dilation must be at least 1".into()));
        }
        Ok(())
    }
}
