//! # Skelview-Model
//!
//! Multi-view skeleton action recognition with spatial-temporal graph
//! convolutional networks (ST-GCN) and convolutional score fusion.
//!
//! ## Architecture Overview
//!
//! ```text
//!  view 0          view 1          view 2        [n, c, t, v, m]
//!    │               │               │
//!  InputNorm       InputNorm       InputNorm     [n*m, c, t, v]
//!    │               │               │
//!  ST-GCN ×10      ST-GCN ×10      ST-GCN ×10    shared edge importance
//!    │               │               │
//!  pool + 1×1      pool + 1×1      pool + 1×1    stage 1: [n, classes]
//!    └───────────────┼───────────────┘
//!       s0⊗s0 s1⊗s1 s2⊗s2 s0⊗s1 s1⊗s2 s2⊗s0      [n, 6, classes, classes]
//!                    │
//!          1×1 conv ─ linear ─ ReLU              stage 2: [n, classes]
//! ```
//!
//! 1. **Input Normalization**: batch norm per (joint, channel) over batch × person and time
//! 2. **Backbone**: ten ST-GCN blocks per view, 3 → 256 channels, time downsampled ×4
//! 3. **View Score Head**: global pooling and a per-view 1×1 projection
//! 4. **Fusion Head**: pairwise score outer products fused by convolution

pub mod backbone;
pub mod block;
pub mod heads;
pub mod inference;
pub mod model;
pub mod normalization;

pub use backbone::*;
pub use block::*;
pub use heads::*;
pub use inference::*;
pub use model::*;
pub use normalization::*;
