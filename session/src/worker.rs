use crossbeam_channel::{Receiver, TryRecvError, bounded};
use retigrade_helpers::PipelineError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use crate::engine::{Analysis, AnalysisRequest, InferenceEngine};

pub type AnalysisOutcome = Result<Analysis, PipelineError>;

/// Runs analyses off the calling thread.
pub struct InferenceWorker;

impl InferenceWorker {
    /// Starts one analysis on a dedicated thread. Exactly one outcome is
    /// reported: the engine's result, or an `Inference` error if the engine
    /// panicked.
    pub fn spawn(
        engine: Arc<dyn InferenceEngine>,
        image: PathBuf,
        request: AnalysisRequest,
        ticket: u64,
    ) -> Result<PendingAnalysis, PipelineError> {
        let (sender, receiver) = bounded::<AnalysisOutcome>(1);
        let name = engine.name();
        thread::Builder::new()
            .name(format!("retigrade-inference-{ticket}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.analyse(&image, &request)))
                    .unwrap_or_else(|payload| {
                        Err(PipelineError::Inference(format!(
                            "analysis panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                if sender.send(outcome).is_err() {
                    debug!(ticket, "analysis finished after its round was dropped");
                }
            })
            .map_err(|e| PipelineError::Inference(format!("failed to spawn inference worker: {e}")))?;
        debug!(ticket, engine = %name, "analysis started");
        Ok(PendingAnalysis {
            ticket,
            receiver,
            delivered: false,
        })
    }
}

/// Handle to an analysis running on an [`InferenceWorker`].
#[derive(Debug)]
pub struct PendingAnalysis {
    ticket: u64,
    receiver: Receiver<AnalysisOutcome>,
    delivered: bool,
}

impl PendingAnalysis {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Returns the outcome if the worker has finished, without blocking.
    /// Once an outcome has been returned every later call yields `None`.
    pub fn try_outcome(&mut self) -> Option<AnalysisOutcome> {
        if self.delivered {
            return None;
        }
        let outcome = match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(worker_lost(self.ticket)),
        };
        self.delivered = true;
        Some(outcome)
    }

    /// Blocks until the worker reports.
    pub fn wait(self) -> AnalysisOutcome {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(worker_lost(self.ticket)))
    }
}

fn worker_lost(ticket: u64) -> PipelineError {
    warn!(ticket, "inference worker exited without reporting");
    PipelineError::Inference("inference worker exited without a result".into())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
