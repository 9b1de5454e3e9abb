//! Similarity and scoring of a training round.
//!
//! The user's stage choice is compared with the classifier's, and their mask
//! with the thresholded saliency via the Dice coefficient. The two 1..=5
//! sub-scores are blended into the final grade.

use masks::MaskError;
use retigrade_helpers::PipelineError;
use thiserror::Error;

mod dice;
mod score;

pub use dice::dice;
pub use score::{MAX_SCORE, MIN_SCORE, ScoreCard, Scorer, area_sub_score, blend, stage_sub_score};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    /// The masks being compared have different shapes.
    #[error("mask shapes differ: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// The user mask could not be brought to the comparison resolution.
    #[error(transparent)]
    Mask(#[from] MaskError),
}

impl From<ScoringError> for PipelineError {
    fn from(err: ScoringError) -> Self {
        match err {
            ScoringError::Mask(inner) => inner.into(),
            other => PipelineError::Inference(other.to_string()),
        }
    }
}
