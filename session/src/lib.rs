//! Orchestration of a grading practice round.
//!
//! [`TrainingRound`] walks the user through annotating an image, hands the
//! heavyweight analysis to an [`InferenceWorker`] so the caller never blocks
//! on the network, and grades the result into a [`RoundRecord`] once the
//! worker reports back. Engines plug in through the [`InferenceEngine`]
//! trait; [`LocalEngine`] runs the stage classifier in-process.

mod engine;
mod record;
mod round;
mod worker;

pub use engine::{Analysis, AnalysisRequest, InferenceEngine, LocalEngine};
pub use record::{HistorySummary, RoundRecord, TARGET_WINDOW};
pub use round::{RoundOutcome, RoundStep, TrainingRound};
pub use worker::{AnalysisOutcome, InferenceWorker, PendingAnalysis};
