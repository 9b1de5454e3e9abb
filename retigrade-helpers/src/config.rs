use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Settings of the stage classifier.
///
/// The network itself is fixed (`tf_efficientnet_b0` with a five-stage head);
/// only the input side and the name of the exported graph's input vary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Side of the square network input, in pixels.
    pub input_size: usize,
    /// Epsilon of the batch-norm layers (TensorFlow-ported weights use 1e-3).
    pub bn_eps: f64,
    /// Name of the image input of the exported graph.
    pub onnx_input: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            bn_eps: 1e-3,
            onnx_input: "image".to_string(),
        }
    }
}

impl ModelConfig {
    /// Spatial side of the `conv_head` activation: the backbone halves the
    /// input five times with "same" padding.
    pub fn feature_size(&self) -> usize {
        (0..5).fold(self.input_size, |side, _| side.div_ceil(2))
    }
}

/// Locations of the weight artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArtifacts {
    /// Classifier checkpoint (`.pt` state dict or `.safetensors`) used for the
    /// forward pass and the saliency backward pass.
    pub weights: PathBuf,
    /// Optional ONNX export of the same model. When present it supplies the
    /// class probabilities.
    pub exported: Option<PathBuf>,
}

impl Default for ModelArtifacts {
    fn default() -> Self {
        Self {
            weights: PathBuf::from("models/best_cls.pt"),
            exported: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Fraction of the most salient pixels marked as AI-attended.
    pub top_frac: f32,
    /// Initial brush radius of the annotation canvas, in image pixels.
    pub brush_radius: u32,
    /// Smallest brush radius the canvas accepts.
    pub min_brush_radius: u32,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            top_frac: 0.30,
            brush_radius: 18,
            min_brush_radius: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the stage-distance sub-score in the final blend.
    pub stage_weight: f64,
    /// Weight of the area-similarity sub-score in the final blend.
    pub area_weight: f64,
    /// Dice cut points awarding 5, 4, 3 and 2 points; anything below scores 1.
    pub area_thresholds: [f64; 4],
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            stage_weight: 0.8,
            area_weight: 0.2,
            area_thresholds: [0.80, 0.60, 0.40, 0.20],
        }
    }
}

/// Top-level configuration of the grading pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub artifacts: ModelArtifacts,
    pub masks: MaskConfig,
    pub scoring: ScoringConfig,
    /// Whether stand-alone inference requests also produce a saliency map.
    pub compute_saliency: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            artifacts: ModelArtifacts::default(),
            masks: MaskConfig::default(),
            scoring: ScoringConfig::default(),
            compute_saliency: true,
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a JSON configuration file. Missing fields take
    /// their default values.
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        let config: PipelineConfig = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let model = &self.model;
        if model.input_size == 0 {
            return Err(PipelineError::Config("model.input_size must be positive".into()));
        }
        if !(model.bn_eps > 0.0 && model.bn_eps.is_finite()) {
            return Err(PipelineError::Config("model.bn_eps must be positive".into()));
        }
        if model.onnx_input.is_empty() {
            return Err(PipelineError::Config("model.onnx_input must not be empty".into()));
        }

        let masks = &self.masks;
        if !(0.0..=1.0).contains(&masks.top_frac) {
            return Err(PipelineError::Config(format!(
                "masks.top_frac must lie in [0, 1], got {}",
                masks.top_frac
            )));
        }
        if masks.min_brush_radius == 0 {
            return Err(PipelineError::Config(
                "masks.min_brush_radius must be positive".into(),
            ));
        }

        let scoring = &self.scoring;
        if scoring.stage_weight < 0.0
            || scoring.area_weight < 0.0
            || scoring.stage_weight + scoring.area_weight <= 0.0
        {
            return Err(PipelineError::Config(
                "scoring weights must be non-negative with a positive sum".into(),
            ));
        }
        let cuts = &scoring.area_thresholds;
        let in_range = cuts.iter().all(|t| (0.0..=1.0).contains(t));
        let descending = cuts.windows(2).all(|w| w[0] > w[1]);
        if !in_range || !descending {
            return Err(PipelineError::Config(
                "scoring.area_thresholds must be strictly descending within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
