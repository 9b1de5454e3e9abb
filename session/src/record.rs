use chrono::{DateTime, Utc};
use retigrade_helpers::Stage;
use scoring::{MAX_SCORE, MIN_SCORE, ScoreCard};
use serde::{Deserialize, Serialize};

/// Number of most recent rounds the target level is computed over.
pub const TARGET_WINDOW: usize = 50;

/// Result of one finished training round, in the shape the external history
/// store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub user_stage: Stage,
    pub ai_stage: Stage,
    pub score: u8,
    pub dice: f64,
    pub p_max: f32,
    pub ts: DateTime<Utc>,
}

impl RoundRecord {
    pub fn new(user_stage: Stage, ai_stage: Stage, card: &ScoreCard, p_max: f32) -> Self {
        Self {
            user_stage,
            ai_stage,
            score: card.final_score,
            dice: card.dice,
            p_max,
            ts: Utc::now(),
        }
    }
}

/// Aggregate progress over a history of rounds, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total: usize,
    pub avg_score: f64,
    pub avg_dice: f64,
    /// Mean score as a percentage of the maximum.
    pub efficiency: f64,
    /// Scores of the most recent rounds, oldest first.
    pub recent_scores: Vec<u8>,
    /// Rounded mean of `recent_scores`, clamped to the score range.
    pub target_level: Option<u8>,
    pub last_ts: Option<DateTime<Utc>>,
}

impl HistorySummary {
    pub fn from_records(records: &[RoundRecord]) -> Self {
        let total = records.len();
        let recent_scores: Vec<u8> = records[total.saturating_sub(TARGET_WINDOW)..]
            .iter()
            .map(|r| r.score)
            .collect();
        let target_level = if recent_scores.is_empty() {
            None
        } else {
            let mean = recent_scores.iter().map(|&s| f64::from(s)).sum::<f64>() / recent_scores.len() as f64;
            Some(mean.round_ties_even().clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8)
        };
        let (avg_score, avg_dice) = if total == 0 {
            (0.0, 0.0)
        } else {
            let n = total as f64;
            (
                records.iter().map(|r| f64::from(r.score)).sum::<f64>() / n,
                records.iter().map(|r| r.dice).sum::<f64>() / n,
            )
        };
        Self {
            total,
            avg_score,
            avg_dice,
            efficiency: avg_score / f64::from(MAX_SCORE) * 100.0,
            recent_scores,
            target_level,
            last_ts: records.last().map(|r| r.ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    fn record(score: u8, dice: f64, minute: u32) -> RoundRecord {
        RoundRecord {
            user_stage: Stage::ALL[1],
            ai_stage: Stage::ALL[2],
            score,
            dice,
            p_max: 0.6,
            ts: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_empty_history() {
        let summary = HistorySummary::from_records(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.efficiency, 0.0);
        assert_eq!(summary.target_level, None);
        assert_eq!(summary.last_ts, None);
    }

    #[test]
    fn test_averages_and_efficiency() {
        let records = [record(5, 0.9, 0), record(3, 0.5, 1), record(4, 0.4, 2)];
        let summary = HistorySummary::from_records(&records);
        assert_eq!(summary.total, 3);
        assert_abs_diff_eq!(summary.avg_score, 4.0);
        assert_abs_diff_eq!(summary.avg_dice, 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.efficiency, 80.0, epsilon = 1e-9);
        assert_eq!(summary.target_level, Some(4));
        assert_eq!(summary.last_ts, Some(records[2].ts));
    }

    #[test]
    fn test_target_level_uses_recent_window() {
        let mut records: Vec<_> = (0..30).map(|i| record(1, 0.0, i % 60)).collect();
        records.extend((0..50).map(|i| record(5, 1.0, i % 60)));
        let summary = HistorySummary::from_records(&records);
        assert_eq!(summary.recent_scores.len(), TARGET_WINDOW);
        assert_eq!(summary.target_level, Some(5));
        assert_eq!(summary.total, 80);
    }

    #[test]
    fn test_record_serialises_with_plain_fields() {
        let json = serde_json::to_value(record(4, 0.55, 5)).unwrap();
        assert_eq!(json["user_stage"], 1);
        assert_eq!(json["ai_stage"], 2);
        assert_eq!(json["score"], 4);
        assert_eq!(json["ts"], "2026-03-01T12:05:00Z");
        let back: RoundRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record(4, 0.55, 5));
    }
}
