//! Input normalization for raw skeleton sequences.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, VarBuilder};

/// Batch normalization over every (joint, coordinate) pair of a skeleton sequence.
///
/// Statistics are taken over the batch × person axis and time, so each joint's
/// channel is normalized independently of the others.
pub struct InputNorm {
    data_bn: BatchNorm,
    in_channels: usize,
    num_node: usize,
}

impl InputNorm {
    pub fn new(in_channels: usize, num_node: usize, vb: VarBuilder) -> Result<Self> {
        let data_bn = batch_norm(in_channels * num_node, 1e-5, vb)?;

        Ok(Self {
            data_bn,
            in_channels,
            num_node,
        })
    }

    /// # Arguments
    /// * `x` - Raw skeletons `[n, c, t, v, m]`
    ///
    /// # Returns
    /// Normalized features `[n * m, c, t, v]`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, c, t, v, m) = x.dims5()?;

        // [n, c, t, v, m] -> [n * m, v * c, t]
        let x = x
            .permute((0, 4, 3, 1, 2))?
            .contiguous()?
            .reshape((n * m, v * c, t))?;
        let x = self.data_bn.forward_t(&x, train)?;

        // [n * m, v * c, t] -> [n * m, c, t, v]
        x.reshape((n, m, v, c, t))?
            .permute((0, 1, 3, 4, 2))?
            .contiguous()?
            .reshape((n * m, c, t, v))
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn num_node(&self) -> usize {
        self.num_node
    }
}
