use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use retigrade_helpers::normalise_unit_interval;

use crate::ModelError;

#[derive(Debug, Clone, Copy)]
pub struct GradCamConfig {
    /// Height of the returned heatmap, in input pixels.
    pub height: usize,
    /// Width of the returned heatmap, in input pixels.
    pub width: usize,
    pub apply_relu: bool,
    pub epsilon: f32,
}

impl GradCamConfig {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            apply_relu: true,
            epsilon: 1e-6,
        }
    }
}

pub struct GradCam;

impl GradCam {
    /// Gradient-weighted class activation map for one `(C, h, w)` capture.
    ///
    /// Channel weights are the spatial mean of the gradient. The weighted sum
    /// of activations is rectified, bilinearly upsampled to the configured
    /// size and stretched into `[0, 1]`. A map without spatial contrast comes
    /// back as all zeros.
    pub fn attribute(
        activations: ArrayView3<f32>,
        gradients: ArrayView3<f32>,
        config: &GradCamConfig,
    ) -> Result<Array2<f32>, ModelError> {
        if activations.shape() != gradients.shape() {
            return Err(ModelError::Inference(format!(
                "activation shape {:?} does not match gradient shape {:?}",
                activations.shape(),
                gradients.shape()
            )));
        }
        let (channels, height, width) = activations.dim();
        if config.height == 0 || config.width == 0 || height == 0 || width == 0 {
            return Err(ModelError::Inference(format!(
                "cannot build a {}x{} heatmap from a {height}x{width} capture",
                config.height, config.width
            )));
        }

        let spatial = (height * width) as f32;
        let weights = gradients.sum_axis(Axis(2)).sum_axis(Axis(1)) / spatial;
        let mut raw = Array2::<f32>::zeros((height, width));
        for channel in 0..channels {
            raw.scaled_add(weights[channel], &activations.index_axis(Axis(0), channel));
        }
        if config.apply_relu {
            raw.mapv_inplace(|v| v.max(0.0));
        }

        let mut heatmap = upsample_bilinear(raw.view(), config.height, config.width);
        if heatmap.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Inference("saliency contains non-finite values".into()));
        }
        normalise_unit_interval(&mut heatmap, config.epsilon)
            .map_err(|e| ModelError::Inference(format!("saliency normalisation: {e}")))?;
        Ok(heatmap)
    }
}

/// Bilinear resize with half-pixel centres (`align_corners = false`).
///
/// `map` must be non-empty.
pub fn upsample_bilinear(map: ArrayView2<f32>, out_height: usize, out_width: usize) -> Array2<f32> {
    let (height, width) = map.dim();
    let scale_y = height as f32 / out_height as f32;
    let scale_x = width as f32 / out_width as f32;
    let xs: Vec<_> = (0..out_width).map(|x| source_coords(x, scale_x, width)).collect();
    Array2::from_shape_fn((out_height, out_width), |(y, x)| {
        let (y0, y1, fy) = source_coords(y, scale_y, height);
        let (x0, x1, fx) = xs[x];
        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

fn source_coords(dst: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, src - i0 as f32)
}
