//! Stage classification with Grad-CAM saliency.
//!
//! An EfficientNet-B0 with timm's tensor layout assigns one of the five
//! retinopathy stages to a preprocessed fundus tensor. For explained requests
//! the `conv_head` output becomes a gradient leaf on a per-call
//! [`CaptureTape`], the class score is backpropagated onto it by candle's
//! autograd, and [`GradCam`] turns activation and gradient into a heatmap over
//! the input. An ONNX export of the same classifier can supply the
//! probabilities through ONNX Runtime.

use retigrade_helpers::PipelineError;
use std::fmt::Display;
use thiserror::Error;

mod cam;
mod classifier;
mod efficientnet;
mod onnx;
mod tape;
mod weights;

pub use cam::{GradCam, GradCamConfig, upsample_bilinear};
pub use classifier::{Explanation, StageClassifier, softmax};
pub use efficientnet::{EfficientNet, HEAD_CHANNELS, parameter_shapes};
pub use onnx::{ExportedModel, OnnxModel};
pub use tape::CaptureTape;
pub use weights::{from_tensors, load_weights, save_weights, seeded_weights};

#[derive(Debug, Error)]
pub enum ModelError {
    /// Weight artifacts are missing, unreadable or do not fit the architecture.
    #[error("model load failed: {0}")]
    Load(String),
    #[error("expected input tensor of shape {expected:?}, got {found:?}")]
    InputShape {
        expected: (usize, usize, usize, usize),
        found: (usize, usize, usize, usize),
    },
    /// Numerical failure during the forward or backward pass.
    #[error("inference failed: {0}")]
    Inference(String),
}

impl ModelError {
    pub(crate) fn load(err: impl Display) -> Self {
        ModelError::Load(err.to_string())
    }

    pub(crate) fn inference(err: impl Display) -> Self {
        ModelError::Inference(err.to_string())
    }
}

impl From<ModelError> for PipelineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Load(msg) => PipelineError::ModelLoad(msg),
            other => PipelineError::Inference(other.to_string()),
        }
    }
}
