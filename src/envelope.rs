//! Out-of-process inference envelope and the image files that travel with it.

use image::{GrayImage, Luma};
use ndarray::{Array2, ArrayView2};
use retigrade_helpers::{NUM_STAGES, PipelineError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use training_session::Analysis;

/// Response of a stand-alone inference run, printed as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEnvelope {
    pub stage_id: u8,
    pub p_max: f32,
    pub probs: [f32; NUM_STAGES],
    /// Grayscale PNG holding the saliency map, when one was written.
    #[serde(alias = "heatmap_png")]
    pub heatmap: Option<PathBuf>,
}

impl InferenceEnvelope {
    pub fn from_analysis(analysis: &Analysis, heatmap: Option<PathBuf>) -> Self {
        Self {
            stage_id: analysis.stage.into(),
            p_max: analysis.p_max,
            probs: analysis.probs,
            heatmap,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Encoding or decoding a PNG failed.
    #[error("{path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// The map is too large to be stored as an image.
    #[error("map of {0}x{1} pixels cannot be written as an image")]
    TooLarge(usize, usize),
}

impl From<EnvelopeError> for PipelineError {
    fn from(err: EnvelopeError) -> Self {
        PipelineError::Decode(err.to_string())
    }
}

/// Stores a `[0, 1]` map as an 8-bit grayscale PNG. Values are scaled by 255
/// and truncated.
pub fn write_heatmap_png(map: ArrayView2<f32>, path: &Path) -> Result<(), EnvelopeError> {
    let (height, width) = map.dim();
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(EnvelopeError::TooLarge(width, height)),
    };
    let image = GrayImage::from_fn(w, h, |x, y| {
        let v = map[[y as usize, x as usize]];
        Luma([(v.clamp(0.0, 1.0) * 255.0) as u8])
    });
    image.save(path).map_err(|source| EnvelopeError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a grayscale PNG back into a `[0, 1]` map.
pub fn read_heatmap_png(path: &Path) -> Result<Array2<f32>, EnvelopeError> {
    let image = open_luma(path)?;
    Ok(Array2::from_shape_fn(
        (image.height() as usize, image.width() as usize),
        |(y, x)| f32::from(image.get_pixel(x as u32, y as u32).0[0]) / 255.0,
    ))
}

/// Reads an annotation image; every non-zero pixel is marked.
pub fn mask_from_png(path: &Path) -> Result<Array2<bool>, EnvelopeError> {
    let image = open_luma(path)?;
    Ok(Array2::from_shape_fn(
        (image.height() as usize, image.width() as usize),
        |(y, x)| image.get_pixel(x as u32, y as u32).0[0] > 0,
    ))
}

fn open_luma(path: &Path) -> Result<GrayImage, EnvelopeError> {
    image::open(path)
        .map(|image| image.to_luma8())
        .map_err(|source| EnvelopeError::Image {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use retigrade_helpers::{Prediction, Stage};

    #[test]
    fn test_heatmap_png_round_trip_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heatmap.png");
        let map = array![[0.0f32, 0.5, 1.0], [0.999, 0.25, 0.1]];
        write_heatmap_png(map.view(), &path).unwrap();
        let back = read_heatmap_png(&path).unwrap();
        assert_eq!(back.dim(), (2, 3));
        assert_abs_diff_eq!(back[[0, 1]], 127.0 / 255.0, epsilon = 1e-6);
        assert_abs_diff_eq!(back[[0, 2]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(back[[1, 0]], 254.0 / 255.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mask_marks_non_zero_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        GrayImage::from_fn(4, 2, |x, _| Luma([if x < 2 { 0 } else { 3 }])).save(&path).unwrap();
        let mask = mask_from_png(&path).unwrap();
        assert_eq!(mask, array![[false, false, true, true], [false, false, true, true]]);
    }

    #[test]
    fn test_missing_png_is_decode_error() {
        let err: PipelineError = mask_from_png(Path::new("/nonexistent/mask.png")).unwrap_err().into();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_envelope_json_shape() {
        let analysis = Analysis::new(Prediction::from_probs([0.1, 0.1, 0.6, 0.1, 0.1]), None);
        let envelope = InferenceEnvelope::from_analysis(&analysis, Some("out/heatmap.png".into()));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["stage_id"], 2);
        assert_eq!(json["heatmap"], "out/heatmap.png");
        assert_eq!(json["probs"].as_array().map(Vec::len), Some(5));
        assert_eq!(analysis.stage, Stage::ALL[2]);

        let legacy = r#"{"stage_id": 1, "p_max": 0.5, "probs": [0.1, 0.5, 0.2, 0.1, 0.1], "heatmap_png": "h.png"}"#;
        let parsed: InferenceEnvelope = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.heatmap, Some(PathBuf::from("h.png")));
    }
}
