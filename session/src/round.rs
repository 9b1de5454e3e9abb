use masks::{UserCanvas, threshold_top_fraction};
use ndarray::Array2;
use retigrade_helpers::{MaskConfig, PipelineConfig, PipelineError, ScoringConfig, Stage};
use scoring::{ScoreCard, Scorer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{Analysis, AnalysisRequest, InferenceEngine};
use crate::record::RoundRecord;
use crate::worker::{AnalysisOutcome, InferenceWorker, PendingAnalysis};

/// Where a training round currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStep {
    /// No image loaded.
    Idle,
    /// The user is marking the suspicious region and picking a stage.
    Annotating,
    /// The focus region is locked in; analysis may be requested.
    Confirmed,
    /// An analysis is running on the worker.
    Analysing,
    /// The round has been graded.
    Finished,
}

/// Everything a finished round produced.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub record: RoundRecord,
    pub analysis: Analysis,
    pub ai_mask: Array2<bool>,
    pub card: ScoreCard,
}

/// One practice round: annotate, confirm, analyse, grade.
///
/// At most one analysis is in flight per round. Resetting the round drops the
/// pending analysis and bumps the generation, so a result that arrives late
/// is never attributed to the next image.
pub struct TrainingRound {
    masks: MaskConfig,
    scorer: Scorer,
    step: RoundStep,
    image: Option<PathBuf>,
    canvas: Option<UserCanvas>,
    user_stage: Option<Stage>,
    generation: u64,
    pending: Option<PendingAnalysis>,
    outcome: Option<RoundOutcome>,
}

impl TrainingRound {
    pub fn new(masks: MaskConfig, scoring: ScoringConfig) -> Self {
        Self {
            masks,
            scorer: Scorer::new(scoring),
            step: RoundStep::Idle,
            image: None,
            canvas: None,
            user_stage: None,
            generation: 0,
            pending: None,
            outcome: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.masks.clone(), config.scoring.clone())
    }

    pub fn step(&self) -> RoundStep {
        self.step
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    pub fn user_stage(&self) -> Option<Stage> {
        self.user_stage
    }

    pub fn canvas(&self) -> Option<&UserCanvas> {
        self.canvas.as_ref()
    }

    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    /// Loads `image` and opens a blank canvas at its resolution. Any previous
    /// round state is discarded.
    pub fn start(&mut self, image: &Path) -> Result<(), PipelineError> {
        let decoded = preprocess::load_rgb(image)?;
        let (width, height) = (decoded.width() as usize, decoded.height() as usize);
        self.reset();
        self.canvas = Some(UserCanvas::with_config(width, height, &self.masks)?);
        self.image = Some(image.to_path_buf());
        self.step = RoundStep::Annotating;
        debug!(image = %image.display(), width, height, "round started");
        Ok(())
    }

    pub fn select_stage(&mut self, stage: Stage) -> Result<(), PipelineError> {
        match self.step {
            RoundStep::Annotating | RoundStep::Confirmed => {
                self.user_stage = Some(stage);
                Ok(())
            }
            step => Err(invalid(step, "select a stage")),
        }
    }

    /// The canvas, while the round is still being annotated.
    pub fn canvas_mut(&mut self) -> Result<&mut UserCanvas, PipelineError> {
        if self.step != RoundStep::Annotating {
            return Err(invalid(self.step, "edit the focus region"));
        }
        self.canvas
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidState("no canvas loaded".into()))
    }

    /// Locks in the painted focus region. An empty canvas is refused.
    pub fn confirm_focus(&mut self) -> Result<(), PipelineError> {
        if self.step != RoundStep::Annotating {
            return Err(invalid(self.step, "confirm the focus region"));
        }
        let painted = self.canvas.as_ref().map_or(0, UserCanvas::painted_pixels);
        if painted == 0 {
            warn!("focus confirmation refused: nothing is marked");
            return Err(PipelineError::DegenerateMask);
        }
        if let Some(canvas) = self.canvas.as_mut() {
            canvas.end_stroke();
        }
        self.step = RoundStep::Confirmed;
        debug!(painted, "focus region confirmed");
        Ok(())
    }

    /// Starts the analysis of the round's image on a worker thread and
    /// returns its ticket.
    pub fn request_analysis(&mut self, engine: Arc<dyn InferenceEngine>) -> Result<u64, PipelineError> {
        match self.step {
            RoundStep::Confirmed => {}
            RoundStep::Analysing => return Err(PipelineError::Busy),
            step => return Err(invalid(step, "request an analysis")),
        }
        if self.user_stage.is_none() {
            return Err(PipelineError::InvalidState(
                "select a stage before requesting an analysis".into(),
            ));
        }
        let image = self
            .image
            .clone()
            .ok_or_else(|| PipelineError::InvalidState("no image loaded".into()))?;

        self.generation += 1;
        let pending = InferenceWorker::spawn(engine, image, AnalysisRequest::default(), self.generation)?;
        self.pending = Some(pending);
        self.step = RoundStep::Analysing;
        Ok(self.generation)
    }

    /// Collects the analysis if it has finished. `None` while it is still
    /// running or when nothing was requested.
    pub fn poll(&mut self) -> Option<Result<RoundOutcome, PipelineError>> {
        let outcome = self.pending.as_mut()?.try_outcome()?;
        let pending = self.pending.take()?;
        Some(self.settle(pending.ticket(), outcome))
    }

    /// Blocks until the running analysis finishes and grades the round.
    pub fn wait(&mut self) -> Result<RoundOutcome, PipelineError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| PipelineError::InvalidState("no analysis is running".into()))?;
        let ticket = pending.ticket();
        self.settle(ticket, pending.wait())
    }

    /// Returns the round to `Idle`, dropping any analysis still in flight.
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(ticket = pending.ticket(), "discarding in-flight analysis");
        }
        self.generation += 1;
        self.step = RoundStep::Idle;
        self.image = None;
        self.canvas = None;
        self.user_stage = None;
        self.outcome = None;
    }

    fn settle(&mut self, ticket: u64, outcome: AnalysisOutcome) -> Result<RoundOutcome, PipelineError> {
        if ticket != self.generation || self.step != RoundStep::Analysing {
            warn!(ticket, generation = self.generation, "discarding stale analysis");
            return Err(PipelineError::InvalidState("analysis belongs to a reset round".into()));
        }
        match outcome.and_then(|analysis| self.grade(analysis)) {
            Ok(graded) => {
                info!(
                    user_stage = graded.record.user_stage.index(),
                    ai_stage = graded.record.ai_stage.index(),
                    score = graded.record.score,
                    dice = graded.record.dice,
                    "round finished"
                );
                self.step = RoundStep::Finished;
                self.outcome = Some(graded.clone());
                Ok(graded)
            }
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "analysis failed");
                self.step = RoundStep::Confirmed;
                Err(err)
            }
        }
    }

    fn grade(&self, analysis: Analysis) -> Result<RoundOutcome, PipelineError> {
        let saliency = analysis
            .saliency
            .as_ref()
            .ok_or_else(|| PipelineError::Inference("analysis returned no saliency map".into()))?;
        let canvas = self
            .canvas
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("no canvas loaded".into()))?;
        let user_stage = self
            .user_stage
            .ok_or_else(|| PipelineError::InvalidState("no stage selected".into()))?;

        let ai_mask = threshold_top_fraction(saliency.view(), f64::from(self.masks.top_frac))?;
        let card = self
            .scorer
            .score(canvas.mask(), ai_mask.view(), user_stage, analysis.stage)?;
        let record = RoundRecord::new(user_stage, analysis.stage, &card, analysis.p_max);
        Ok(RoundOutcome {
            record,
            analysis,
            ai_mask,
            card,
        })
    }
}

fn invalid(step: RoundStep, action: &str) -> PipelineError {
    PipelineError::InvalidState(format!("cannot {action} while the round is {step:?}"))
}
