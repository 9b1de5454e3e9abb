use grad_cam::StageClassifier;
use ndarray::Array2;
use retigrade_helpers::{NUM_STAGES, PipelineConfig, PipelineError, Prediction, Stage};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// What an analysis should produce besides the prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Class to explain; `None` explains the predicted stage.
    pub class: Option<Stage>,
    /// Whether to run the backward pass and return a saliency map.
    pub with_saliency: bool,
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        Self {
            class: None,
            with_saliency: true,
        }
    }
}

impl AnalysisRequest {
    pub fn prediction_only() -> Self {
        Self {
            class: None,
            with_saliency: false,
        }
    }
}

/// Complete result of one analysis. Never partially filled: a failed
/// analysis is an `Err`, not an `Analysis` with missing parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub stage: Stage,
    pub probs: [f32; NUM_STAGES],
    pub p_max: f32,
    pub saliency: Option<Array2<f32>>,
}

impl Analysis {
    pub fn new(prediction: Prediction, saliency: Option<Array2<f32>>) -> Self {
        Self {
            stage: prediction.stage,
            probs: prediction.probs,
            p_max: prediction.p_max(),
            saliency,
        }
    }
}

/// A trait that defines the common interface for everything able to analyse
/// a retina image.
pub trait InferenceEngine: Send + Sync {
    /// Classifies the image at `image` and, if requested, explains the result.
    fn analyse(&self, image: &Path, request: &AnalysisRequest) -> Result<Analysis, PipelineError>;

    /// Return the name of the engine (e.g., "EfficientNet-B0 224px").
    fn name(&self) -> String;
}

/// In-process engine over a shared, read-only classifier.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    classifier: Arc<StageClassifier>,
}

impl LocalEngine {
    pub fn new(classifier: Arc<StageClassifier>) -> Self {
        Self { classifier }
    }

    /// Loads the weight artifacts named in `config`.
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let classifier = StageClassifier::load(&config.artifacts, &config.model)?;
        Ok(Self::new(Arc::new(classifier)))
    }

    pub fn classifier(&self) -> &Arc<StageClassifier> {
        &self.classifier
    }
}

impl InferenceEngine for LocalEngine {
    fn analyse(&self, image: &Path, request: &AnalysisRequest) -> Result<Analysis, PipelineError> {
        let started = Instant::now();
        let tensor = preprocess::preprocess_path(image, self.classifier.config().input_size)?;
        let analysis = if request.with_saliency {
            let explanation = self.classifier.predict_and_explain(tensor.view(), request.class)?;
            Analysis::new(explanation.prediction, Some(explanation.saliency))
        } else {
            Analysis::new(self.classifier.predict(tensor.view())?, None)
        };
        debug!(
            image = %image.display(),
            stage = analysis.stage.index(),
            p_max = analysis.p_max,
            with_saliency = request.with_saliency,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis finished"
        );
        Ok(analysis)
    }

    fn name(&self) -> String {
        format!("EfficientNet-B0 {}px", self.classifier.config().input_size)
    }
}
