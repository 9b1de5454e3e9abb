//! Turns retina photographs into the tensor layout the stage classifier expects.
//!
//! The classifier was trained on RGB samples scaled to `[0, 1]`, area-resized
//! to a fixed square and laid out channel-first with a batch of one, so every
//! caller has to go through the same conversion to get comparable predictions.

use image::RgbImage;
use ndarray::Array4;
use retigrade_helpers::PipelineError;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

mod area;

pub use area::resize_area;

/// Side of the square input used by the shipped classifier.
pub const DEFAULT_TARGET_SIZE: usize = 224;

/// Errors that can occur while loading or converting an image.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// The file could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The bytes are not an image in a supported format.
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    /// The decoded image has no pixels.
    #[error("image has zero width or height")]
    Empty,
    /// A zero-sized output was requested.
    #[error("target size must be positive")]
    InvalidTargetSize,
}

impl From<PreprocessError> for PipelineError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::InvalidTargetSize => PipelineError::Config(err.to_string()),
            other => PipelineError::Decode(other.to_string()),
        }
    }
}

/// Reads and decodes an image file into 8-bit RGB.
///
/// The file is read into memory first and decoded from the buffer, so paths
/// are never handed to a codec that might mangle non-ASCII names.
pub fn load_rgb(path: &Path) -> Result<RgbImage, PreprocessError> {
    let bytes = std::fs::read(path).map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_rgb(&bytes)
}

/// Decodes an in-memory image into 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::Empty);
    }
    Ok(image)
}

/// Converts a decoded image into a `(1, 3, size, size)` tensor in `[0, 1]`.
///
/// # Errors
///
/// Returns `PreprocessError::InvalidTargetSize` for `size == 0` and
/// `PreprocessError::Empty` for an image without pixels.
pub fn to_tensor(image: &RgbImage, size: usize) -> Result<Array4<f32>, PreprocessError> {
    if size == 0 {
        return Err(PreprocessError::InvalidTargetSize);
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::Empty);
    }
    let resized = resize_area(image, size, size);
    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        (resized[[y, x, c]] / 255.0).clamp(0.0, 1.0)
    });
    debug!(
        width = image.width(),
        height = image.height(),
        size,
        "converted image to input tensor"
    );
    Ok(tensor)
}

/// Loads the image at `path` and converts it with [`to_tensor`].
pub fn preprocess_path(path: &Path, size: usize) -> Result<Array4<f32>, PreprocessError> {
    let image = load_rgb(path)?;
    to_tensor(&image, size)
}

/// Decodes `bytes` and converts the image with [`to_tensor`].
pub fn preprocess_bytes(bytes: &[u8], size: usize) -> Result<Array4<f32>, PreprocessError> {
    let image = decode_rgb(bytes)?;
    to_tensor(&image, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use proptest::prelude::*;

    #[test]
    fn test_output_shape_and_range() {
        let image = RgbImage::from_fn(300, 180, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let tensor = to_tensor(&image, DEFAULT_TARGET_SIZE).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 224, 224));
        assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_channels_stay_in_rgb_order() {
        let image = RgbImage::from_pixel(10, 10, Rgb([255, 0, 51]));
        let tensor = to_tensor(&image, 4).unwrap();
        assert_abs_diff_eq!(tensor[[0, 0, 2, 2]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tensor[[0, 1, 2, 2]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tensor[[0, 2, 2, 2]], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_target_size_is_rejected() {
        let image = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        assert!(matches!(to_tensor(&image, 0), Err(PreprocessError::InvalidTargetSize)));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let result = preprocess_bytes(b"definitely not a png", 224);
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
        let err: PipelineError = result.unwrap_err().into();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = preprocess_path(Path::new("/nonexistent/retina.png"), 224);
        assert!(matches!(result, Err(PreprocessError::Io { .. })));
    }

    #[test]
    fn test_png_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fundus.png");
        RgbImage::from_pixel(64, 48, Rgb([10, 120, 240])).save(&path).unwrap();
        let tensor = preprocess_path(&path, 32).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 32, 32));
        assert_abs_diff_eq!(tensor[[0, 1, 16, 16]], 120.0 / 255.0, epsilon = 1e-5);
    }

    proptest! {
        #[test]
        fn prop_values_stay_in_unit_range(
            width in 1u32..40,
            height in 1u32..40,
            size in 1usize..48,
            seed in any::<u32>(),
        ) {
            let image = RgbImage::from_fn(width, height, |x, y| {
                let v = seed.wrapping_mul(31).wrapping_add(x * 7 + y * 13);
                Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
            });
            let tensor = to_tensor(&image, size).unwrap();
            prop_assert_eq!(tensor.dim(), (1, 3, size, size));
            prop_assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }
}
