//! Inference engine for multi-view action recognition.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use skelview_core::{Error, ModelConfig, Result};

use crate::model::{FusionOutput, MultiViewScoreFusion, VIEW_COUNT};

/// Inference engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Model configuration
    pub model: ModelConfig,
    /// Device to run inference on
    pub device: DeviceType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

/// Inference engine owning the model and its weights
pub struct InferenceEngine {
    model: MultiViewScoreFusion,
    /// Present when weights were created in memory rather than memory-mapped
    varmap: Option<VarMap>,
    device: Device,
    config: InferenceConfig,
}

impl InferenceEngine {
    /// Create a new inference engine with random weights (for testing)
    pub fn new_random(config: InferenceConfig) -> Result<Self> {
        let device = Self::get_device(config.device)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = MultiViewScoreFusion::new(config.model.clone(), vb)?;
        tracing::info!(
            parameters = varmap.all_vars().len(),
            "initialized random weights"
        );

        Ok(Self {
            model,
            varmap: Some(varmap),
            device,
            config,
        })
    }

    /// Load model from checkpoint
    pub fn load<P: AsRef<Path>>(path: P, config: InferenceConfig) -> Result<Self> {
        let device = Self::get_device(config.device)?;

        // Load weights from safetensors file
        // SAFETY: the checkpoint must not be modified while it is mapped
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.as_ref()], DType::F32, &device)?
        };

        let model = MultiViewScoreFusion::new(config.model.clone(), vb)?;
        tracing::info!(path = %path.as_ref().display(), "loaded checkpoint");

        Ok(Self {
            model,
            varmap: None,
            device,
            config,
        })
    }

    /// Save in-memory weights as safetensors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let varmap = self.varmap.as_ref().ok_or(Error::ReadOnlyWeights)?;
        varmap.save(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "saved checkpoint");
        Ok(())
    }

    fn get_device(device_type: DeviceType) -> Result<Device> {
        let device = match device_type {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceType::Metal => Device::new_metal(0)?,
        };
        Ok(device)
    }

    /// Build a `[n, c, t, v, m]` input tensor on the engine's device
    pub fn input_tensor(
        &self,
        data: Vec<f32>,
        shape: (usize, usize, usize, usize, usize),
    ) -> Result<Tensor> {
        Ok(Tensor::from_vec(data, shape, &self.device)?)
    }

    /// Raw per-view and fused scores
    pub fn forward(&self, x1: &Tensor, x2: &Tensor, x3: &Tensor) -> Result<FusionOutput> {
        self.model.forward(x1, x2, x3)
    }

    /// Top-scoring action per sample
    pub fn predict(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        x3: &Tensor,
    ) -> Result<Vec<ActionPrediction>> {
        let output = self.forward(x1, x2, x3)?;

        let classes: Vec<u32> = output.fused.argmax(1)?.to_vec1()?;
        let scores: Vec<Vec<f32>> = output.fused.to_vec2()?;

        let mut view_classes = Vec::with_capacity(VIEW_COUNT);
        for scores in &output.view_scores {
            view_classes.push(scores.argmax(1)?.to_vec1::<u32>()?);
        }

        let predictions: Vec<ActionPrediction> = classes
            .iter()
            .enumerate()
            .map(|(b, &class)| ActionPrediction {
                class: class as usize,
                score: scores[b][class as usize],
                view_classes: [
                    view_classes[0][b] as usize,
                    view_classes[1][b] as usize,
                    view_classes[2][b] as usize,
                ],
            })
            .collect();

        tracing::debug!(batch = predictions.len(), "predicted actions");
        Ok(predictions)
    }

    pub fn model(&self) -> &MultiViewScoreFusion {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

/// Predicted action for one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPrediction {
    /// Arg-max class of the fused scores
    pub class: usize,
    /// Fused score of that class
    pub score: f32,
    /// Arg-max class of each view's stage-1 scores
    pub view_classes: [usize; VIEW_COUNT],
}
