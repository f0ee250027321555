//! Score heads.
//!
//! Two stages turn backbone features into class scores:
//! 1. View Score Head: pools one view's features and projects them to class scores
//! 2. Fusion Head: combines pairwise outer products of the three views' scores

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

/// Ordered view pairs whose score outer products feed the fusion head.
///
/// Three self products followed by the cyclic cross products `0⊗1`, `1⊗2`,
/// `2⊗0`. The reversed pairs are never formed, and checkpoints depend on this
/// channel order.
pub const FUSION_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (2, 0)];

/// Per-view projection from pooled backbone features to class scores
pub struct ViewScoreHead {
    projector: Conv2d,
    in_channels: usize,
    num_class: usize,
}

impl ViewScoreHead {
    pub fn new(in_channels: usize, num_class: usize, vb: VarBuilder) -> Result<Self> {
        let projector = conv2d(in_channels, num_class, 1, Conv2dConfig::default(), vb)?;

        Ok(Self {
            projector,
            in_channels,
            num_class,
        })
    }

    /// # Arguments
    /// * `features` - Backbone output `[n * m, channels, t, v]`
    /// * `num_person` - Skeletons per sample `m`
    ///
    /// # Returns
    /// Scores `[n, num_class]`
    pub fn forward(&self, features: &Tensor, num_person: usize) -> Result<Tensor> {
        let (nm, channels, _, _) = features.dims4()?;
        if num_person == 0 || nm % num_person != 0 {
            bail!("cannot split {nm} feature maps into groups of {num_person} persons");
        }
        let n = nm / num_person;

        // Global average pool over time and joints, then over persons
        let pooled = features.mean(3)?.mean(2)?;
        let pooled = pooled.reshape((n, num_person, channels))?.mean(1)?;

        let scores = self
            .projector
            .forward(&pooled.reshape((n, channels, 1, 1))?)?;
        scores.reshape((n, self.num_class))
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }
}

/// Batched outer product `[n, c] ⊗ [n, c] -> [n, c, c]`
fn outer(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    a.unsqueeze(2)?.matmul(&b.unsqueeze(1)?)
}

/// Stack the six score matrices of [`FUSION_PAIRS`] along a channel axis.
///
/// # Arguments
/// * `scores` - Per-view scores, each `[n, num_class]`
///
/// # Returns
/// Tensor `[n, 6, num_class, num_class]`
pub fn pairwise_scores(scores: &[Tensor; 3]) -> Result<Tensor> {
    let matrices = FUSION_PAIRS
        .iter()
        .map(|&(a, b)| outer(&scores[a], &scores[b]))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&matrices, 1)
}

/// Cross-view fusion of stage-1 scores
pub struct FusionHead {
    conv: Conv2d,
    linear: Linear,
    num_class: usize,
}

impl FusionHead {
    /// # Arguments
    /// * `conv_vb` - Scope of the 6 → 1 channel 1×1 convolution
    /// * `linear_vb` - Scope of the `num_class²` → `num_class` projection
    pub fn new(num_class: usize, conv_vb: VarBuilder, linear_vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(FUSION_PAIRS.len(), 1, 1, Conv2dConfig::default(), conv_vb)?;
        let linear = linear(num_class * num_class, num_class, linear_vb)?;

        Ok(Self {
            conv,
            linear,
            num_class,
        })
    }

    /// # Arguments
    /// * `scores` - Per-view scores, each `[n, num_class]`
    ///
    /// # Returns
    /// Fused non-negative scores `[n, num_class]`
    pub fn forward(&self, scores: &[Tensor; 3]) -> Result<Tensor> {
        let stacked = pairwise_scores(scores)?;
        let n = stacked.dim(0)?;

        let fused = self.conv.forward(&stacked)?;
        let fused = fused.reshape((n, self.num_class * self.num_class))?;
        self.linear.forward(&fused)?.relu()
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }
}
