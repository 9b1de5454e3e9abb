use ndarray::{Array2, ArrayView2};

use crate::MaskError;

/// Nearest-neighbour resize of a binary mask to `height x width`.
///
/// Output pixel `d` samples source pixel `floor(d * src / dst)` on each axis,
/// so no fractional boundary pixels are invented.
pub fn resize_nearest(
    mask: ArrayView2<bool>,
    height: usize,
    width: usize,
) -> Result<Array2<bool>, MaskError> {
    let (src_h, src_w) = mask.dim();
    if src_h == 0 || src_w == 0 {
        return Err(MaskError::EmptyMap);
    }
    if height == 0 || width == 0 {
        return Err(MaskError::ZeroSize { width, height });
    }
    if (src_h, src_w) == (height, width) {
        return Ok(mask.to_owned());
    }
    let cols: Vec<usize> = (0..width).map(|x| x * src_w / width).collect();
    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        mask[[y * src_h / height, cols[x]]]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_upscale_repeats_pixels() {
        let mask = array![[true, false], [false, true]];
        let up = resize_nearest(mask.view(), 4, 4).unwrap();
        assert_eq!(
            up,
            array![
                [true, true, false, false],
                [true, true, false, false],
                [false, false, true, true],
                [false, false, true, true],
            ]
        );
    }

    #[test]
    fn test_downscale_picks_top_left_samples() {
        let mask = array![[true, false, false], [false, false, false], [false, false, true]];
        let down = resize_nearest(mask.view(), 2, 2).unwrap();
        // Rows and columns 0 and 1 of the source.
        assert_eq!(down, array![[true, false], [false, false]]);
    }

    #[test]
    fn test_same_size_is_copy() {
        let mask = array![[true, false, true]];
        assert_eq!(resize_nearest(mask.view(), 1, 3).unwrap(), mask);
    }

    #[test]
    fn test_degenerate_sizes_are_rejected() {
        let mask = array![[true]];
        assert!(resize_nearest(mask.view(), 0, 3).is_err());
        let empty = Array2::<bool>::from_elem((0, 0), false);
        assert!(matches!(resize_nearest(empty.view(), 2, 2), Err(MaskError::EmptyMap)));
    }
}
