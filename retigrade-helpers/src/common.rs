use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Number of ordinal disease-severity classes the classifier distinguishes.
pub const NUM_STAGES: usize = 5;

const STAGE_LABELS: [&str; NUM_STAGES] = [
    "No retinopathy",
    "Mild",
    "Moderate",
    "Severe",
    "Proliferative",
];

/// One of the five diabetic-retinopathy severity stages (0 = none .. 4 = proliferative).
///
/// Serialised as the bare stage number so records stay compatible with the
/// history store, which keys on `user_stage`/`ai_stage` integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Stage(u8);

impl Stage {
    pub const ALL: [Stage; NUM_STAGES] = [Stage(0), Stage(1), Stage(2), Stage(3), Stage(4)];

    /// Returns `None` when `index` is not a valid stage.
    pub fn new(index: usize) -> Option<Self> {
        if index < NUM_STAGES {
            Some(Stage(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Number of stages separating `self` from `other`.
    pub fn distance(self, other: Stage) -> usize {
        self.0.abs_diff(other.0) as usize
    }

    pub fn label(self) -> &'static str {
        STAGE_LABELS[self.index()]
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} ({})", self.0, self.label())
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stage::new(value as usize).ok_or_else(|| format!("stage {value} is out of range 0..=4"))
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.0
    }
}

/// Class probabilities for one image together with the argmax stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub stage: Stage,
    pub probs: [f32; NUM_STAGES],
}

impl Prediction {
    /// Builds a prediction from a probability vector, picking the most likely
    /// stage. Ties resolve to the lowest stage index.
    pub fn from_probs(probs: [f32; NUM_STAGES]) -> Self {
        let mut best = 0;
        for (idx, &p) in probs.iter().enumerate().skip(1) {
            if p > probs[best] {
                best = idx;
            }
        }
        Prediction {
            stage: Stage(best as u8),
            probs,
        }
    }

    /// Probability assigned to the predicted stage.
    pub fn p_max(&self) -> f32 {
        self.probs[self.stage.index()]
    }
}
