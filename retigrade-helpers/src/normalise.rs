use ndarray::{ArrayBase, DataMut, Dimension};
use ndarray_stats::QuantileExt;
use ndarray_stats::errors::MinMaxError;

use crate::Float;

/// Range below which a map is treated as uniform.
pub const DEFAULT_EPSILON: f32 = 1e-6;

/// Min-max stretches `values` into `[0, 1]` in place.
///
/// The smallest element becomes exactly 0 and the largest exactly 1. A map
/// whose range does not exceed `epsilon` carries no spatial information and is
/// zeroed instead of being divided by a vanishing range.
///
/// # Errors
///
/// Returns `MinMaxError::EmptyInput` for an empty array and
/// `MinMaxError::UndefinedOrder` when the array contains NaN. The array is left
/// untouched in both cases.
pub fn normalise_unit_interval<F, S, D>(
    values: &mut ArrayBase<S, D>,
    epsilon: F,
) -> Result<(), MinMaxError>
where
    F: Float,
    S: DataMut<Elem = F>,
    D: Dimension,
{
    let min = *values.min()?;
    let max = *values.max()?;
    let range = max - min;
    if range <= epsilon {
        values.fill(F::zero());
        return Ok(());
    }
    values.mapv_inplace(|v| (v - min) / range);
    Ok(())
}
