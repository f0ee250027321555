//! # Skelview-Core
//!
//! Core types for multi-view skeleton action recognition: the skeleton
//! graph builder that produces partitioned adjacency matrices, model
//! configuration, and the shared error type.

pub mod config;
pub mod error;
pub mod graph;

pub use config::*;
pub use error::{Error, Result};
pub use graph::*;
