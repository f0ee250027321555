//! Complete multi-view ST-GCN model with convolutional score fusion.

use candle_core::{IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};

use skelview_core::{Error, Graph, ModelConfig, Result};

use crate::backbone::{BackboneConfig, StGcnBackbone, BACKBONE_OUT_CHANNELS};
use crate::heads::{FusionHead, ViewScoreHead};
use crate::normalization::InputNorm;

/// Number of camera views fused by the model
pub const VIEW_COUNT: usize = 3;

/// Multi-view skeleton action recognition model.
///
/// Each view runs through its own normalization pass, backbone and score head
/// (stage 1). The three score vectors are then fused through their pairwise
/// outer products (stage 2).
///
/// The adjacency is a fixed buffer, and the per-block edge importance masks
/// form a single collection applied to all three views.
pub struct MultiViewScoreFusion {
    graph: Graph,
    /// One `[K, V, V]` copy per view, stacked as `[3, K, V, V]`
    view_adjacency: Tensor,
    edge_importance: Option<Vec<Tensor>>,
    input_norm: InputNorm,
    backbones: Vec<StGcnBackbone>,
    view_heads: Vec<ViewScoreHead>,
    fusion: FusionHead,
    config: ModelConfig,
}

impl MultiViewScoreFusion {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let graph = Graph::new(&config.graph)?;
        let (k, v, _) = graph.shape();

        let adjacency = graph.to_tensor(vb.device())?.to_dtype(vb.dtype())?;
        let view_adjacency = Tensor::stack(&[&adjacency, &adjacency, &adjacency], 0)?;

        let input_norm = InputNorm::new(config.in_channels, v, vb.pp("data_bn"))?;

        let backbone_config = BackboneConfig {
            in_channels: config.in_channels,
            temporal_kernel_size: config.temporal_kernel_size,
            spatial_kernel_size: k,
            block: config.block,
        };
        let backbones = (0..VIEW_COUNT)
            .map(|view| {
                StGcnBackbone::new(
                    backbone_config.clone(),
                    vb.pp(format!("view{view}")).pp("st_gcn_networks"),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let edge_importance = if config.edge_importance_weighting {
            let ivb = vb.pp("edge_importance_stage1");
            let masks = (0..backbones[0].num_blocks())
                .map(|i| ivb.get_with_hints((k, v, v), &i.to_string(), Init::Const(1.0)))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Some(masks)
        } else {
            None
        };

        let view_heads = (0..VIEW_COUNT)
            .map(|view| {
                ViewScoreHead::new(
                    BACKBONE_OUT_CHANNELS,
                    config.num_class,
                    vb.pp("predict_stage1").pp(view),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let fusion = FusionHead::new(
            config.num_class,
            vb.pp("predict_stage2"),
            vb.pp("linear_stage2"),
        )?;

        tracing::info!(
            layout = %config.graph.layout,
            num_node = v,
            num_partitions = k,
            num_class = config.num_class,
            edge_importance = config.edge_importance_weighting,
            "built multi-view ST-GCN"
        );

        Ok(Self {
            graph,
            view_adjacency,
            edge_importance,
            input_norm,
            backbones,
            view_heads,
            fusion,
            config,
        })
    }

    /// Inference forward pass (running statistics, no dropout)
    pub fn forward(&self, x1: &Tensor, x2: &Tensor, x3: &Tensor) -> Result<FusionOutput> {
        self.forward_t(x1, x2, x3, false)
    }

    /// Forward pass over three synchronized views
    ///
    /// # Arguments
    /// * `x1`, `x2`, `x3` - Skeleton sequences `[n, c, t, v, m]`, identical shapes
    /// * `train` - Batch statistics and active dropout when `true`
    ///
    /// # Returns
    /// Per-view scores and fused scores, each `[n, num_class]`
    pub fn forward_t(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        x3: &Tensor,
        train: bool,
    ) -> Result<FusionOutput> {
        let num_person = self.check_inputs([x1, x2, x3])?;

        let view_scores = [
            self.view_forward(0, x1, num_person, train)?,
            self.view_forward(1, x2, num_person, train)?,
            self.view_forward(2, x3, num_person, train)?,
        ];
        let fused = self.fusion.forward(&view_scores)?;

        Ok(FusionOutput { view_scores, fused })
    }

    /// Stage 1 for a single view
    fn view_forward(
        &self,
        view: usize,
        x: &Tensor,
        num_person: usize,
        train: bool,
    ) -> Result<Tensor> {
        let x = self.input_norm.forward_t(x, train)?;
        let adjacency = self.view_adjacency.i(view)?;
        let features = self.backbones[view].forward_t(
            &x,
            &adjacency,
            self.edge_importance.as_deref(),
            train,
        )?;
        Ok(self.view_heads[view].forward(&features, num_person)?)
    }

    /// Validate view shapes against each other and the configuration.
    ///
    /// Returns the person count `m`.
    fn check_inputs(&self, views: [&Tensor; VIEW_COUNT]) -> Result<usize> {
        for (view, x) in views.iter().enumerate() {
            if x.rank() != 5 {
                return Err(Error::RankMismatch {
                    view,
                    actual: x.rank(),
                });
            }
        }

        let reference = views[0].dims();
        for (view, x) in views.iter().enumerate().skip(1) {
            if x.dims() != reference {
                return Err(Error::ViewShapeMismatch {
                    view,
                    expected: reference.to_vec(),
                    actual: x.dims().to_vec(),
                });
            }
        }

        let (n, c, t, v, m) = views[0].dims5()?;
        for (dim, size) in [("batch", n), ("time", t), ("person", m)] {
            if size == 0 {
                return Err(Error::EmptyDimension { view: 0, dim });
            }
        }
        if c != self.config.in_channels {
            return Err(Error::DimensionMismatch {
                view: 0,
                dim: "channel",
                expected: self.config.in_channels,
                actual: c,
            });
        }
        if v != self.graph.num_node() {
            return Err(Error::DimensionMismatch {
                view: 0,
                dim: "vertex",
                expected: self.graph.num_node(),
                actual: v,
            });
        }
        Ok(m)
    }

    /// Edge importance masks shared by every view, `None` when disabled
    pub fn edge_importance(&self) -> Option<&[Tensor]> {
        self.edge_importance.as_deref()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn backbones(&self) -> &[StGcnBackbone] {
        &self.backbones
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// Outputs of one forward pass
#[derive(Debug, Clone)]
pub struct FusionOutput {
    /// Stage-1 scores per view, each `[n, num_class]`
    pub view_scores: [Tensor; VIEW_COUNT],
    /// Stage-2 fused scores `[n, num_class]`, non-negative
    pub fused: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use skelview_core::{GraphConfig, Layout};

    fn test_config(num_class: usize, edge_importance_weighting: bool) -> ModelConfig {
        ModelConfig {
            num_class,
            edge_importance_weighting,
            ..Default::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn all_finite(t: &Tensor) -> bool {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.is_finite())
    }

    #[test]
    fn test_forward_shapes_and_finite() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(5, true), vb)?;

        let shape = (2, 3, 10, 18, 1);
        let x1 = Tensor::randn(0f32, 1f32, shape, &device)?;
        let x2 = Tensor::randn(0f32, 1f32, shape, &device)?;
        let x3 = Tensor::randn(0f32, 1f32, shape, &device)?;

        for train in [false, true] {
            let output = model.forward_t(&x1, &x2, &x3, train)?;
            for scores in &output.view_scores {
                assert_eq!(scores.dims(), &[2, 5]);
                assert!(all_finite(scores));
            }
            assert_eq!(output.fused.dims(), &[2, 5]);
            assert!(all_finite(&output.fused));
        }
        Ok(())
    }

    #[test]
    fn test_multiple_persons() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(4, true), vb)?;

        let x = Tensor::randn(0f32, 1f32, (3, 3, 12, 18, 2), &device)?;
        let output = model.forward_t(&x, &x, &x, true)?;
        assert_eq!(output.fused.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn test_fused_scores_non_negative() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(6, true), vb)?;

        let shape = (4, 3, 10, 18, 1);
        let x1 = (Tensor::randn(0f32, 1f32, shape, &device)? * 10.0)?;
        let x2 = Tensor::randn(0f32, 1f32, shape, &device)?;
        let x3 = Tensor::randn(0f32, 1f32, shape, &device)?;

        let fused: Vec<Vec<f32>> = model.forward(&x1, &x2, &x3)?.fused.to_vec2()?;
        assert!(fused.iter().flatten().all(|&v| v >= 0.0));
        Ok(())
    }

    #[test]
    fn test_importance_shared_across_views() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(5, true), vb)?;

        let masks = model.edge_importance().expect("importance enabled");
        assert_eq!(masks.len(), 10);
        assert!(masks.iter().all(|m| m.dims() == [3, 18, 18]));

        let data = varmap.data().lock().unwrap();
        let stored = data
            .keys()
            .filter(|k| k.starts_with("edge_importance_stage1."))
            .count();
        assert_eq!(stored, 10);
        assert_eq!(model.backbones().len(), VIEW_COUNT);
        Ok(())
    }

    #[test]
    fn test_disabled_importance_uses_raw_adjacency() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let disabled = MultiViewScoreFusion::new(test_config(5, false), vb.clone())?;
        assert!(disabled.edge_importance().is_none());
        assert!(!varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .any(|k| k.starts_with("edge_importance")));

        // Same varmap: every other weight is shared, masks start at one
        let enabled = MultiViewScoreFusion::new(test_config(5, true), vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 3, 10, 18, 1), &device)?;
        let before = disabled.forward(&x, &x, &x)?;
        let with_ones = enabled.forward(&x, &x, &x)?;
        assert!(max_abs_diff(&before.fused, &with_ones.fused) < 1e-6);
        for view in 0..VIEW_COUNT {
            assert!(max_abs_diff(&before.view_scores[view], &with_ones.view_scores[view]) < 1e-6);
        }

        // Rescaling the masks changes the weighted model only
        {
            let data = varmap.data().lock().unwrap();
            for (name, var) in data.iter() {
                if name.starts_with("edge_importance_stage1.") {
                    var.set(&(var.as_tensor() * 3.0)?)?;
                }
            }
        }

        let after = disabled.forward(&x, &x, &x)?;
        let with_scaled = enabled.forward(&x, &x, &x)?;
        assert_eq!(max_abs_diff(&before.fused, &after.fused), 0.0);
        for view in 0..VIEW_COUNT {
            assert_eq!(
                max_abs_diff(&before.view_scores[view], &after.view_scores[view]),
                0.0
            );
        }
        // Every view's pass reads the same masks
        for view in 0..VIEW_COUNT {
            assert!(
                max_abs_diff(&with_ones.view_scores[view], &with_scaled.view_scores[view]) > 0.0,
                "view {view} ignored the shared masks"
            );
        }
        Ok(())
    }

    #[test]
    fn test_views_are_independently_parameterized() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(5, true), vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 3, 10, 18, 1), &device)?;
        let output = model.forward(&x, &x, &x)?;
        assert!(max_abs_diff(&output.view_scores[0], &output.view_scores[1]) > 0.0);
        assert!(max_abs_diff(&output.view_scores[1], &output.view_scores[2]) > 0.0);

        // Copy view 0's backbone and projector into views 1 and 2
        {
            let data = varmap.data().lock().unwrap();
            for view in 1..VIEW_COUNT {
                for (name, var) in data.iter() {
                    let source = if let Some(rest) = name.strip_prefix(&format!("view{view}.")) {
                        format!("view0.{rest}")
                    } else if let Some(rest) =
                        name.strip_prefix(&format!("predict_stage1.{view}."))
                    {
                        format!("predict_stage1.0.{rest}")
                    } else {
                        continue;
                    };
                    var.set(data[&source].as_tensor())?;
                }
            }
        }

        let output = model.forward(&x, &x, &x)?;
        assert_eq!(
            max_abs_diff(&output.view_scores[0], &output.view_scores[1]),
            0.0
        );
        assert_eq!(
            max_abs_diff(&output.view_scores[0], &output.view_scores[2]),
            0.0
        );
        Ok(())
    }

    #[test]
    fn test_shape_mismatches_rejected() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewScoreFusion::new(test_config(5, true), vb)?;

        let x = Tensor::zeros((2, 3, 10, 18, 1), DType::F32, &device)?;
        let shorter = Tensor::zeros((2, 3, 8, 18, 1), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&x, &shorter, &x),
            Err(Error::ViewShapeMismatch { view: 1, .. })
        ));

        let two_channels = Tensor::zeros((2, 2, 10, 18, 1), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&two_channels, &two_channels, &two_channels),
            Err(Error::DimensionMismatch { dim: "channel", .. })
        ));

        let ntu = Tensor::zeros((2, 3, 10, 25, 1), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&ntu, &ntu, &ntu),
            Err(Error::DimensionMismatch { dim: "vertex", .. })
        ));

        let no_person = Tensor::zeros((2, 3, 10, 18, 0), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&no_person, &no_person, &no_person),
            Err(Error::EmptyDimension { dim: "person", .. })
        ));

        let no_frames = Tensor::zeros((2, 3, 0, 18, 1), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&no_frames, &no_frames, &no_frames),
            Err(Error::EmptyDimension { dim: "time", .. })
        ));

        let rank4 = Tensor::zeros((2, 3, 10, 18), DType::F32, &device)?;
        assert!(matches!(
            model.forward(&x, &x, &rank4),
            Err(Error::RankMismatch { view: 2, actual: 4 })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_configuration_fails_at_construction() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let bad_graph = ModelConfig {
            graph: GraphConfig {
                layout: Layout::Custom {
                    num_node: 4,
                    edges: vec![(0, 9)],
                    center: 0,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            MultiViewScoreFusion::new(bad_graph, vb.clone()),
            Err(Error::InvalidTopology(_))
        ));

        let no_classes = test_config(0, true);
        assert!(matches!(
            MultiViewScoreFusion::new(no_classes, vb),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_ntu_layout() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig {
            num_class: 3,
            graph: GraphConfig {
                layout: Layout::NtuRgbD,
                ..Default::default()
            },
            ..Default::default()
        };
        let model = MultiViewScoreFusion::new(config, vb)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 10, 25, 2), &device)?;
        let output = model.forward_t(&x, &x, &x, false)?;
        assert_eq!(output.fused.dims(), &[1, 3]);
        Ok(())
    }
}
