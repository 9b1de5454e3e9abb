use ndarray::NdFloat;
use num_traits::{AsPrimitive, FromPrimitive, NumCast, Signed};

use std::iter::Sum;

mod common;
mod config;
mod error;
mod normalise;

pub use common::{NUM_STAGES, Prediction, Stage};
pub use config::{MaskConfig, ModelArtifacts, ModelConfig, PipelineConfig, ScoringConfig};
pub use error::PipelineError;
pub use normalise::{DEFAULT_EPSILON, normalise_unit_interval};

/// Scalar bound shared by the numeric routines of the workspace.
///
/// Saliency maps are produced as `f32`, but thresholding and normalisation are
/// written against this trait so callers holding `f64` maps can use them too.
pub trait Float:
    NdFloat + FromPrimitive + Default + Signed + Sum + AsPrimitive<usize> + std::marker::Unpin
{
    fn cast<T: NumCast>(x: T) -> Option<Self> {
        NumCast::from(x)
    }
}

impl Float for f32 {}

impl Float for f64 {}
