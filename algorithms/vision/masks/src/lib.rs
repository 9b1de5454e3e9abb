//! Binary attention masks.
//!
//! The AI mask comes from thresholding a saliency map at a top-fraction
//! quantile; the user mask is painted stroke by stroke on a [`UserCanvas`].

use retigrade_helpers::PipelineError;
use thiserror::Error;

mod canvas;
mod resize;
mod threshold;

pub use canvas::{BrushMode, StrokeEvent, UserCanvas};
pub use resize::resize_nearest;
pub use threshold::threshold_top_fraction;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MaskError {
    /// The requested top fraction lies outside `[0, 1]`.
    #[error("top fraction must lie in [0, 1], got {0}")]
    InvalidFraction(f64),
    /// The input map has no pixels.
    #[error("map has no pixels")]
    EmptyMap,
    /// The input map contains NaN or infinite values.
    #[error("map contains non-finite values")]
    NonFinite,
    /// A canvas or resize target without pixels was requested.
    #[error("mask size {width}x{height} must be positive")]
    ZeroSize { width: usize, height: usize },
}

impl From<MaskError> for PipelineError {
    fn from(err: MaskError) -> Self {
        match err {
            MaskError::InvalidFraction(_) | MaskError::ZeroSize { .. } => {
                PipelineError::Config(err.to_string())
            }
            MaskError::EmptyMap | MaskError::NonFinite => PipelineError::Inference(err.to_string()),
        }
    }
}
