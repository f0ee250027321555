//! Spatial-temporal graph convolution unit.
//!
//! One block applies a graph convolution over the skeleton joints followed by
//! a temporal convolution over frames:
//!
//! ```text
//! x ──► gcn(x, A) ──► BN ─ ReLU ─ Conv(kt×1, stride s) ─ BN ─ Dropout ──► + ──► ReLU
//! │                                                                      ▲
//! └──────────────────────────── residual ────────────────────────────────┘
//! ```
//!
//! Parameter paths follow the usual PyTorch layout (`gcn.conv`, `tcn.0`,
//! `tcn.2`, `tcn.3`, `residual.0`, `residual.1`) so converted checkpoints load
//! without renaming.

use candle_core::{bail, Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, init, BatchNorm, Conv2d, Conv2dConfig, Dropout, Init, VarBuilder,
};

use skelview_core::BlockOptions;

/// Convolution along the time axis of a `(N, C, T, V)` tensor with a `(kt, 1)` kernel.
///
/// candle's 2D convolution only supports symmetric stride and padding, so the
/// joints are folded into the batch and a 1D convolution runs over time. The
/// weight keeps its 4D `(out, in, kt, 1)` shape.
struct TemporalConv {
    weight: Tensor,
    bias: Tensor,
    out_channels: usize,
    stride: usize,
    padding: usize,
}

impl TemporalConv {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel_size, 1),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1. / ((in_channels * kernel_size) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        Ok(Self {
            weight,
            bias,
            out_channels,
            stride,
            padding,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, t, v) = x.dims4()?;

        // [n, c, t, v] -> [n * v, c, t]
        let x = x.permute((0, 3, 1, 2))?.contiguous()?.reshape((n * v, c, t))?;
        let kernel = self.weight.squeeze(3)?;
        let y = x.conv1d(&kernel, self.padding, self.stride, 1, 1)?;
        let y = y.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)?;

        let t_out = y.dim(2)?;
        y.reshape((n, v, self.out_channels, t_out))?
            .permute((0, 2, 3, 1))?
            .contiguous()
    }
}

/// Graph convolution with `K` spatial kernels.
///
/// A 1×1 convolution expands `in` channels to `out * K`, then each of the `K`
/// channel groups is aggregated over the joints with its adjacency partition:
/// `y[n, c, t, w] = Σ_k Σ_v x[n, k, c, t, v] · A[k, v, w]`.
pub struct GraphConv {
    conv: Conv2d,
    kernel_size: usize,
    out_channels: usize,
}

impl GraphConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv2d(
            in_channels,
            out_channels * kernel_size,
            1,
            Conv2dConfig::default(),
            vb.pp("conv"),
        )?;

        Ok(Self {
            conv,
            kernel_size,
            out_channels,
        })
    }

    /// # Arguments
    /// * `x` - Features `[n, in, t, v]`
    /// * `a` - Adjacency partitions `[K, v, v]`
    ///
    /// # Returns
    /// Features `[n, out, t, v]`
    pub fn forward(&self, x: &Tensor, a: &Tensor) -> Result<Tensor> {
        let k = a.dim(0)?;
        if k != self.kernel_size {
            bail!(
                "adjacency has {k} partitions but the graph convolution expects {}",
                self.kernel_size
            );
        }

        let x = self.conv.forward(x)?;
        let (n, _, t, v) = x.dims4()?;

        let x = x.reshape((n, k, self.out_channels * t, v))?;
        let y = x.broadcast_matmul(&a.unsqueeze(0)?)?;
        y.sum(1)?.reshape((n, self.out_channels, t, v))
    }
}

enum Residual {
    None,
    Identity,
    Projection { conv: TemporalConv, bn: BatchNorm },
}

/// Spatial-temporal graph convolution block
pub struct StGcnBlock {
    gcn: GraphConv,
    tcn_bn_in: BatchNorm,
    tcn_conv: TemporalConv,
    tcn_bn_out: BatchNorm,
    dropout: Dropout,
    residual: Residual,
    dropout_rate: f32,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
}

impl StGcnBlock {
    /// # Arguments
    /// * `kernel_size` - `(temporal, spatial)`, the temporal size must be odd
    /// * `residual` - `false` disables the shortcut entirely
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: usize,
        residual: bool,
        options: &BlockOptions,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (temporal, spatial) = kernel_size;
        if temporal % 2 != 1 {
            bail!("temporal kernel size must be odd, got {temporal}");
        }
        let padding = (temporal - 1) / 2;

        let gcn = GraphConv::new(in_channels, out_channels, spatial, vb.pp("gcn"))?;

        let tcn = vb.pp("tcn");
        let tcn_bn_in = batch_norm(out_channels, 1e-5, tcn.pp("0"))?;
        let tcn_conv = TemporalConv::new(
            out_channels,
            out_channels,
            temporal,
            stride,
            padding,
            tcn.pp("2"),
        )?;
        let tcn_bn_out = batch_norm(out_channels, 1e-5, tcn.pp("3"))?;

        let residual = if !residual {
            Residual::None
        } else if in_channels == out_channels && stride == 1 {
            Residual::Identity
        } else {
            let res = vb.pp("residual");
            let conv = TemporalConv::new(in_channels, out_channels, 1, stride, 0, res.pp("0"))?;
            let bn = batch_norm(out_channels, 1e-5, res.pp("1"))?;
            Residual::Projection { conv, bn }
        };

        Ok(Self {
            gcn,
            tcn_bn_in,
            tcn_conv,
            tcn_bn_out,
            dropout: Dropout::new(options.dropout),
            residual,
            dropout_rate: options.dropout,
            in_channels,
            out_channels,
            stride,
        })
    }

    /// # Arguments
    /// * `x` - Features `[n, in, t, v]`
    /// * `a` - Adjacency `[K, v, v]`, already scaled by edge importance if enabled
    /// * `train` - Batch statistics and active dropout when `true`
    ///
    /// # Returns
    /// Features `[n, out, ceil(t / stride), v]`
    pub fn forward_t(&self, x: &Tensor, a: &Tensor, train: bool) -> Result<Tensor> {
        let res = match &self.residual {
            Residual::None => None,
            Residual::Identity => Some(x.clone()),
            Residual::Projection { conv, bn } => Some(bn.forward_t(&conv.forward(x)?, train)?),
        };

        let y = self.gcn.forward(x, a)?;

        let y = self.tcn_bn_in.forward_t(&y, train)?.relu()?;
        let y = self.tcn_conv.forward(&y)?;
        let y = self.tcn_bn_out.forward_t(&y, train)?;
        let y = self.dropout.forward(&y, train)?;

        let y = match res {
            Some(res) => (y + res)?,
            None => y,
        };
        y.relu()
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn dropout_rate(&self) -> f32 {
        self.dropout_rate
    }

    pub fn has_residual(&self) -> bool {
        !matches!(self.residual, Residual::None)
    }
}
