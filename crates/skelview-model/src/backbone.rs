//! Ten-block ST-GCN backbone for a single view.
//!
//! The stack widens from the input channels to 256 with two temporal
//! downsampling points:
//!
//! ```text
//! C ─► 64 ×4 ─► 128 (stride 2) ─► 128 ×2 ─► 256 (stride 2) ─► 256 ×2
//! ```

use candle_core::{bail, Result, Tensor};
use candle_nn::VarBuilder;

use skelview_core::BlockOptions;

use crate::block::StGcnBlock;

/// Shape of one block in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub residual: bool,
}

/// Channel width after the last block
pub const BACKBONE_OUT_CHANNELS: usize = 256;

/// Block layout for a backbone reading `in_channels` input channels.
///
/// The first block has no residual shortcut because its input width rarely
/// matches its output.
pub fn block_plan(in_channels: usize) -> Vec<BlockSpec> {
    let spec = |in_channels, out_channels, stride| BlockSpec {
        in_channels,
        out_channels,
        stride,
        residual: true,
    };

    vec![
        BlockSpec {
            residual: false,
            ..spec(in_channels, 64, 1)
        },
        spec(64, 64, 1),
        spec(64, 64, 1),
        spec(64, 64, 1),
        spec(64, 128, 2),
        spec(128, 128, 1),
        spec(128, 128, 1),
        spec(128, 256, 2),
        spec(256, 256, 1),
        spec(256, BACKBONE_OUT_CHANNELS, 1),
    ]
}

/// Backbone configuration
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    /// Input channels per joint
    pub in_channels: usize,
    /// Temporal kernel size (odd)
    pub temporal_kernel_size: usize,
    /// Spatial kernel size, equal to the adjacency partition count
    pub spatial_kernel_size: usize,
    /// Options for every block after the first
    pub block: BlockOptions,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            temporal_kernel_size: 9,
            spatial_kernel_size: 3,
            block: BlockOptions::default(),
        }
    }
}

/// ST-GCN block stack for one view
pub struct StGcnBackbone {
    blocks: Vec<StGcnBlock>,
    config: BackboneConfig,
}

impl StGcnBackbone {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let kernel_size = (config.temporal_kernel_size, config.spatial_kernel_size);

        let blocks = block_plan(config.in_channels)
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                // The input block never sees dropout
                let options = if i == 0 {
                    config.block.without_dropout()
                } else {
                    config.block
                };
                StGcnBlock::new(
                    spec.in_channels,
                    spec.out_channels,
                    kernel_size,
                    spec.stride,
                    spec.residual,
                    &options,
                    vb.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { blocks, config })
    }

    /// Forward pass through every block
    ///
    /// # Arguments
    /// * `x` - Normalized features `[n * m, c, t, v]`
    /// * `adjacency` - Partitioned adjacency `[K, v, v]`
    /// * `importance` - One `[K, v, v]` mask per block, or `None` to use the raw adjacency
    ///
    /// # Returns
    /// Features `[n * m, 256, t / 4, v]`
    pub fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Tensor,
        importance: Option<&[Tensor]>,
        train: bool,
    ) -> Result<Tensor> {
        if let Some(importance) = importance {
            if importance.len() != self.blocks.len() {
                bail!(
                    "expected {} edge importance masks, got {}",
                    self.blocks.len(),
                    importance.len()
                );
            }
        }

        let mut x = x.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            x = match importance {
                Some(importance) => block.forward_t(&x, &(adjacency * &importance[i])?, train)?,
                None => block.forward_t(&x, adjacency, train)?,
            };
        }
        Ok(x)
    }

    pub fn blocks(&self) -> &[StGcnBlock] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn out_channels(&self) -> usize {
        BACKBONE_OUT_CHANNELS
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use skelview_core::{Graph, GraphConfig};

    #[test]
    fn test_block_plan() {
        let plan = block_plan(3);
        assert_eq!(plan.len(), 10);
        assert_eq!(plan[0].in_channels, 3);
        assert!(!plan[0].residual);
        assert!(plan[1..].iter().all(|b| b.residual));

        let strides: Vec<usize> = plan.iter().map(|b| b.stride).collect();
        assert_eq!(strides, vec![1, 1, 1, 1, 2, 1, 1, 2, 1, 1]);

        // Consecutive blocks chain their widths
        for pair in plan.windows(2) {
            assert_eq!(pair[0].out_channels, pair[1].in_channels);
        }
        assert_eq!(plan[9].out_channels, 256);
    }

    #[test]
    fn test_first_block_drops_dropout() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let config = BackboneConfig {
            block: BlockOptions { dropout: 0.5 },
            ..Default::default()
        };
        let backbone = StGcnBackbone::new(config, vb)?;

        assert_eq!(backbone.blocks()[0].dropout_rate(), 0.0);
        assert!(backbone.blocks()[1..].iter().all(|b| b.dropout_rate() == 0.5));
        Ok(())
    }

    #[test]
    fn test_backbone_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let backbone = StGcnBackbone::new(BackboneConfig::default(), vb)?;
        let a = Graph::new(&GraphConfig::default())
            .unwrap()
            .to_tensor(&device)
            .unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 10, 18), &device)?;
        let out = backbone.forward_t(&x, &a, None, true)?;
        assert_eq!(out.dims(), &[2, 256, 3, 18]);
        assert_eq!(backbone.num_blocks(), 10);
        Ok(())
    }

    #[test]
    fn test_importance_count_checked() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let backbone = StGcnBackbone::new(BackboneConfig::default(), vb)?;
        let a = Tensor::ones((3, 18, 18), DType::F32, &device)?;
        let masks = vec![a.clone(); 4];
        let x = Tensor::zeros((1, 3, 10, 18), DType::F32, &device)?;

        assert!(backbone.forward_t(&x, &a, Some(&masks), false).is_err());
        Ok(())
    }
}
