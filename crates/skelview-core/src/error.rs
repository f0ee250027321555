//! Error types for the Skelview system.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown skeleton layout: {0}")]
    UnknownLayout(String),

    #[error("Unknown partition strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid graph topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("View {view}: expected a rank-5 (N, C, T, V, M) tensor, got rank {actual}")]
    RankMismatch { view: usize, actual: usize },

    #[error("View {view}: {dim} mismatch, expected {expected}, got {actual}")]
    DimensionMismatch {
        view: usize,
        dim: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("View {view}: {dim} dimension is empty")]
    EmptyDimension { view: usize, dim: &'static str },

    #[error("View {view} shape {actual:?} differs from view 0 shape {expected:?}")]
    ViewShapeMismatch {
        view: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Weights were memory-mapped from a checkpoint and cannot be saved")]
    ReadOnlyWeights,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
