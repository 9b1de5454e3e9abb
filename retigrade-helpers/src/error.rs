use thiserror::Error;

/// Failure taxonomy shared by every stage of the grading pipeline.
///
/// Component crates keep their own detailed error enums and convert into this
/// type at the orchestrator boundary, so the interactive layer only ever sees
/// one of these variants together with a message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// The image file is unreadable or is not a valid image.
    #[error("could not decode image: {0}")]
    Decode(String),
    /// Weight artifacts are missing or do not match the network architecture.
    #[error("could not load model: {0}")]
    ModelLoad(String),
    /// The forward or backward pass failed.
    #[error("inference failed: {0}")]
    Inference(String),
    /// The user has not marked any region yet.
    #[error("the user mask is empty; mark a region before requesting analysis")]
    DegenerateMask,
    /// An analysis is already running for this round.
    #[error("an analysis is already in flight for this round")]
    Busy,
    /// The operation is not allowed at the current step of the round.
    #[error("invalid round state: {0}")]
    InvalidState(String),
    /// Configuration values are out of range or could not be read.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Only inference failures can succeed when re-triggered with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Inference(_))
    }
}
