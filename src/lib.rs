//! Diabetic-retinopathy grading practice.
//!
//! A retina photograph is classified into one of five severity stages and
//! explained with a Grad-CAM saliency map. The user's own stage choice and
//! hand-painted focus region are then graded against the classifier on a
//! 1..=5 scale.
//!
//! The pipeline lives in the workspace crates re-exported here:
//! [`preprocess`] → [`grad_cam`] → [`masks`] → [`scoring`], orchestrated by
//! [`session`].

pub mod envelope;
pub mod process;

pub use grad_cam;
pub use masks;
pub use preprocess;
pub use retigrade_helpers as helpers;
pub use scoring;
pub use training_session as session;

pub use envelope::{InferenceEnvelope, mask_from_png, read_heatmap_png, write_heatmap_png};
pub use process::ProcessEngine;
pub use retigrade_helpers::{PipelineConfig, PipelineError, Prediction, Stage};
