use image::RgbImage;
use ndarray::Array3;

/// Source pixels, with their weights, that one output pixel averages over.
type Taps = Vec<(usize, f32)>;

/// Resizes `image` to `width x height` by area averaging.
///
/// Every output pixel is the mean of the source region its footprint covers,
/// with partially covered source pixels weighted by the covered fraction. This
/// keeps fine vessel texture from aliasing when large fundus photographs are
/// shrunk to the network input size. Upscaling degrades to a blend of the one
/// or two source pixels under the footprint.
///
/// Returns an `(height, width, 3)` array of samples still in `0..=255`.
pub fn resize_area(image: &RgbImage, width: usize, height: usize) -> Array3<f32> {
    let src_w = image.width() as usize;
    let src_h = image.height() as usize;
    let raw = image.as_raw();

    let cols = area_taps(src_w, width);
    let rows = area_taps(src_h, height);

    // Horizontal pass straight from the packed RGB buffer.
    let mut horizontal = Array3::<f32>::zeros((src_h, width, 3));
    for y in 0..src_h {
        let row = &raw[y * src_w * 3..(y + 1) * src_w * 3];
        for (x, taps) in cols.iter().enumerate() {
            for c in 0..3 {
                let mut acc = 0.0f32;
                for &(sx, w) in taps {
                    acc += w * row[sx * 3 + c] as f32;
                }
                horizontal[[y, x, c]] = acc;
            }
        }
    }

    let mut out = Array3::<f32>::zeros((height, width, 3));
    for (y, taps) in rows.iter().enumerate() {
        for x in 0..width {
            for c in 0..3 {
                let mut acc = 0.0f32;
                for &(sy, w) in taps {
                    acc += w * horizontal[[sy, x, c]];
                }
                out[[y, x, c]] = acc;
            }
        }
    }
    out
}

/// Coverage weights mapping `src` samples onto `dst` samples along one axis.
/// The weights of each output sample sum to one.
fn area_taps(src: usize, dst: usize) -> Vec<Taps> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src);
            let mut taps = Vec::with_capacity(last.saturating_sub(first));
            for s in first..last {
                let overlap = end.min(s as f64 + 1.0) - start.max(s as f64);
                if overlap > 0.0 {
                    taps.push((s, (overlap / scale) as f32));
                }
            }
            taps
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;

    fn gray_row(values: &[u8]) -> RgbImage {
        RgbImage::from_fn(values.len() as u32, 1, |x, _| {
            let v = values[x as usize];
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_taps_sum_to_one() {
        for (src, dst) in [(7, 3), (3, 7), (224, 224), (1000, 224)] {
            for taps in area_taps(src, dst) {
                let total: f32 = taps.iter().map(|&(_, w)| w).sum();
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_integer_downscale_averages_blocks() {
        let image = gray_row(&[0, 10, 20, 30]);
        let out = resize_area(&image, 2, 1);
        assert_abs_diff_eq!(out[[0, 0, 0]], 5.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out[[0, 1, 0]], 25.0, epsilon = 1e-4);
    }

    #[test]
    fn test_fractional_downscale_weights_partial_pixels() {
        // Footprints are [0, 1.5) and [1.5, 3).
        let image = gray_row(&[0, 3, 6]);
        let out = resize_area(&image, 2, 1);
        assert_abs_diff_eq!(out[[0, 0, 1]], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out[[0, 1, 1]], 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_square_downscale_averages_quad() {
        let image = RgbImage::from_fn(2, 2, |x, y| {
            let v = (x + 2 * y) as u8 * 40;
            Rgb([v, 0, 255 - v])
        });
        let out = resize_area(&image, 1, 1);
        assert_eq!(out.dim(), (1, 1, 3));
        assert_abs_diff_eq!(out[[0, 0, 0]], 60.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out[[0, 0, 2]], 195.0, epsilon = 1e-4);
    }

    #[test]
    fn test_upscale_keeps_constant_image() {
        let image = gray_row(&[77]);
        let out = resize_area(&image, 5, 4);
        assert!(out.iter().all(|&v| (v - 77.0).abs() < 1e-4));
    }
}
