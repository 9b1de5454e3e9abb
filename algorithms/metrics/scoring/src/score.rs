use masks::resize_nearest;
use ndarray::ArrayView2;
use retigrade_helpers::{ScoringConfig, Stage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ScoringError;
use crate::dice::dice;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

/// Breakdown of one graded round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub dice: f64,
    pub area_sub: u8,
    pub stage_sub: u8,
    pub final_score: u8,
}

/// Maps a Dice coefficient onto 1..=5 using the descending cut points of
/// `config`.
pub fn area_sub_score(dice: f64, config: &ScoringConfig) -> u8 {
    config
        .area_thresholds
        .iter()
        .position(|&cut| dice >= cut)
        .map_or(MIN_SCORE, |i| MAX_SCORE - i as u8)
}

/// One point off per stage of disagreement, never below 1.
pub fn stage_sub_score(user: Stage, ai: Stage) -> u8 {
    let penalty = user.distance(ai).min((MAX_SCORE - MIN_SCORE) as usize) as u8;
    MAX_SCORE - penalty
}

/// Weighted blend of the two sub-scores, rounded half to even and clamped
/// to 1..=5.
pub fn blend(stage_sub: u8, area_sub: u8, config: &ScoringConfig) -> u8 {
    let raw = config.stage_weight * f64::from(stage_sub) + config.area_weight * f64::from(area_sub);
    if !raw.is_finite() {
        return MIN_SCORE;
    }
    raw.round_ties_even()
        .clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8
}

/// Grades a training round against the classifier.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Scores a user mask against the AI mask. The user mask is brought to the
    /// AI mask's resolution with nearest-neighbour sampling first.
    pub fn score(
        &self,
        user_mask: ArrayView2<bool>,
        ai_mask: ArrayView2<bool>,
        user_stage: Stage,
        ai_stage: Stage,
    ) -> Result<ScoreCard, ScoringError> {
        let (height, width) = ai_mask.dim();
        let user = resize_nearest(user_mask, height, width)?;
        let overlap = dice(user.view(), ai_mask)?;
        Ok(self.grade(overlap, user_stage, ai_stage))
    }

    /// Scores a Dice value computed elsewhere.
    pub fn grade(&self, dice: f64, user_stage: Stage, ai_stage: Stage) -> ScoreCard {
        let dice = if dice.is_finite() { dice.clamp(0.0, 1.0) } else { 0.0 };
        let area_sub = area_sub_score(dice, &self.config);
        let stage_sub = stage_sub_score(user_stage, ai_stage);
        let final_score = blend(stage_sub, area_sub, &self.config);
        debug!(dice, area_sub, stage_sub, final_score, "graded round");
        ScoreCard {
            dice,
            area_sub,
            stage_sub,
            final_score,
        }
    }
}
