use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use ndarray_stats::interpolate::Linear;
use noisy_float::types::n64;
use retigrade_helpers::{DEFAULT_EPSILON, Float, normalise_unit_interval};
use tracing::debug;

use crate::MaskError;

/// Marks the `top_frac` most salient pixels of `map`.
///
/// The map is first stretched into `[0, 1]`, so callers may pass raw
/// activations. The cut point is the linearly interpolated quantile at
/// `1 - top_frac`, and every pixel at or above it is set. Ties at the cut are
/// all included, so a uniform map yields a full mask.
///
/// # Errors
///
/// `MaskError::InvalidFraction` for `top_frac` outside `[0, 1]`,
/// `MaskError::EmptyMap` for a map without pixels and `MaskError::NonFinite`
/// when the map holds NaN or infinities.
pub fn threshold_top_fraction<F: Float>(
    map: ArrayView2<F>,
    top_frac: f64,
) -> Result<Array2<bool>, MaskError> {
    if !(0.0..=1.0).contains(&top_frac) {
        return Err(MaskError::InvalidFraction(top_frac));
    }
    if map.is_empty() {
        return Err(MaskError::EmptyMap);
    }
    if map.iter().any(|v| !v.is_finite()) {
        return Err(MaskError::NonFinite);
    }

    let mut values = map.to_owned();
    let epsilon = F::cast(DEFAULT_EPSILON).ok_or(MaskError::NonFinite)?;
    normalise_unit_interval(&mut values, epsilon).map_err(|_| MaskError::NonFinite)?;

    let mut flat = values
        .iter()
        .map(|v| v.to_f64())
        .collect::<Option<Array1<f64>>>()
        .ok_or(MaskError::NonFinite)?;
    let cut = flat
        .quantile_axis_skipnan_mut(Axis(0), n64(1.0 - top_frac), &Linear)
        .map_err(|_| MaskError::EmptyMap)?
        .into_scalar();
    let mask = values.mapv(|v| v.to_f64().is_some_and(|v| v >= cut));
    debug!(
        top_frac,
        marked = mask.iter().filter(|&&m| m).count(),
        total = mask.len(),
        "thresholded saliency map"
    );
    Ok(mask)
}
