use ndarray::{Array2, ArrayView1, ArrayView4};
use retigrade_helpers::{ModelArtifacts, ModelConfig, NUM_STAGES, Prediction, Stage};
use std::fmt;
use tracing::{debug, info};

use crate::ModelError;
use crate::cam::{GradCam, GradCamConfig};
use crate::efficientnet::EfficientNet;
use crate::onnx::{ExportedModel, OnnxModel};
use crate::weights::load_weights;

/// Result of an explained inference.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub prediction: Prediction,
    /// Class the saliency map was computed for.
    pub target: Stage,
    /// Heatmap over the input tensor, values in `[0, 1]`.
    pub saliency: Array2<f32>,
}

/// Stage classifier with Grad-CAM saliency.
///
/// The primary network always serves the backward pass. When an exported
/// graph is supplied it provides the class probabilities instead, while an
/// unspecified Grad-CAM target still follows the primary network's own
/// prediction.
pub struct StageClassifier {
    primary: EfficientNet,
    exported: Option<Box<dyn ExportedModel>>,
}

impl fmt::Debug for StageClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageClassifier")
            .field("config", self.primary.config())
            .field("exported", &self.exported.is_some())
            .finish()
    }
}

impl StageClassifier {
    /// Loads the weight artifacts. A missing or malformed file is a
    /// [`ModelError::Load`], so the failure surfaces before the first request.
    pub fn load(artifacts: &ModelArtifacts, config: &ModelConfig) -> Result<Self, ModelError> {
        let primary = load_weights(&artifacts.weights, config)?;
        let exported = match &artifacts.exported {
            Some(path) => Some(Box::new(OnnxModel::load(path, config)?) as Box<dyn ExportedModel>),
            None => None,
        };
        info!(
            exported = exported.is_some(),
            feature_size = config.feature_size(),
            "stage classifier ready"
        );
        Ok(Self::new(primary, exported))
    }

    pub fn new(primary: EfficientNet, exported: Option<Box<dyn ExportedModel>>) -> Self {
        Self { primary, exported }
    }

    pub fn config(&self) -> &ModelConfig {
        self.primary.config()
    }

    /// Class probabilities for a `(1, 3, S, S)` tensor.
    pub fn predict(&self, input: ArrayView4<f32>) -> Result<Prediction, ModelError> {
        let probs = match &self.exported {
            Some(graph) => softmax(ArrayView1::from(&graph.logits(input)?[..]))?,
            None => softmax(self.primary.forward(input)?.view())?,
        };
        Ok(Prediction::from_probs(probs))
    }

    /// Prediction plus a saliency map for `class`, or for the primary
    /// network's argmax when `class` is `None`.
    pub fn predict_and_explain(
        &self,
        input: ArrayView4<f32>,
        class: Option<Stage>,
    ) -> Result<Explanation, ModelError> {
        let (logits, mut tape) = self.primary.forward_captured(input)?;
        let own = Prediction::from_probs(softmax(logits.view())?);
        let prediction = match &self.exported {
            Some(graph) => Prediction::from_probs(softmax(ArrayView1::from(&graph.logits(input)?[..]))?),
            None => own,
        };
        let target = class.unwrap_or(own.stage);

        tape.backward(target.index())?;
        let size = self.primary.config().input_size;
        let saliency = GradCam::attribute(tape.activation(), tape.gradient(), &GradCamConfig::new(size, size))?;
        debug!(
            stage = prediction.stage.index(),
            p_max = prediction.p_max(),
            target = target.index(),
            "explained prediction"
        );
        Ok(Explanation {
            prediction,
            target,
            saliency,
        })
    }
}

/// Numerically stable softmax over the five stage logits.
pub fn softmax(logits: ArrayView1<f32>) -> Result<[f32; NUM_STAGES], ModelError> {
    if logits.len() != NUM_STAGES {
        return Err(ModelError::Inference(format!(
            "expected {NUM_STAGES} logits, got {}",
            logits.len()
        )));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::Inference("logits contain non-finite values".into()));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs = [0.0f32; NUM_STAGES];
    for (p, &logit) in probs.iter_mut().zip(logits.iter()) {
        *p = (logit - max).exp();
    }
    let total: f32 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= total);
    Ok(probs)
}
