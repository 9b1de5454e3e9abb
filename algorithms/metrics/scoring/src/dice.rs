use ndarray::{ArrayView2, Zip};

use crate::ScoringError;

/// Dice coefficient `2|A ∩ B| / (|A| + |B|)` of two equally shaped masks.
///
/// Two empty masks score 0.
pub fn dice(a: ArrayView2<bool>, b: ArrayView2<bool>) -> Result<f64, ScoringError> {
    if a.dim() != b.dim() {
        return Err(ScoringError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    let (mut both, mut total) = (0usize, 0usize);
    Zip::from(&a).and(&b).for_each(|&x, &y| {
        both += usize::from(x && y);
        total += usize::from(x) + usize::from(y);
    });
    if total == 0 {
        return Ok(0.0);
    }
    Ok(2.0 * both as f64 / total as f64)
}
