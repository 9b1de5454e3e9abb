use candle_core::{D, IndexOp, Tensor, Var};
use ndarray::{Array3, ArrayView3};

use crate::ModelError;
use crate::efficientnet::to_array3;

/// Activation and gradient captured at `conv_head` for one forward pass.
///
/// Each explained inference gets its own tape, so concurrent requests never
/// observe each other's captures and the network itself stays read-only.
#[derive(Debug, Clone)]
pub struct CaptureTape {
    activation: Array3<f32>,
    gradient: Array3<f32>,
    leaf: Var,
    logits: Tensor,
}

impl CaptureTape {
    /// `logits` must have been computed from `leaf`.
    pub(crate) fn record(leaf: Var, logits: Tensor) -> Result<Self, ModelError> {
        let activation = to_array3(leaf.as_tensor())?;
        let gradient = Array3::zeros(activation.raw_dim());
        Ok(Self {
            activation,
            gradient,
            leaf,
            logits,
        })
    }

    pub fn activation(&self) -> ArrayView3<'_, f32> {
        self.activation.view()
    }

    pub fn gradient(&self) -> ArrayView3<'_, f32> {
        self.gradient.view()
    }

    pub fn zero_grad(&mut self) {
        self.gradient.fill(0.0);
    }

    /// Backpropagates the logit of `class` to the captured activation.
    ///
    /// The gradient is cleared first, so repeated calls for different classes
    /// never accumulate.
    pub fn backward(&mut self, class: usize) -> Result<ArrayView3<'_, f32>, ModelError> {
        let classes = self.logits.dim(D::Minus1).map_err(ModelError::inference)?;
        if class >= classes {
            return Err(ModelError::Inference(format!(
                "class {class} is outside the {classes} network outputs"
            )));
        }
        self.zero_grad();

        let score = self.logits.i((0, class)).map_err(ModelError::inference)?;
        let grads = score.backward().map_err(ModelError::inference)?;
        let grad = grads
            .get(self.leaf.as_tensor())
            .ok_or_else(|| ModelError::Inference("no gradient reached conv_head".into()))?;
        self.gradient += &to_array3(grad)?;
        Ok(self.gradient.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efficientnet::EfficientNet;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use ndarray::Array4;
    use retigrade_helpers::ModelConfig;

    fn net() -> EfficientNet {
        let config = ModelConfig {
            input_size: 64,
            ..ModelConfig::default()
        };
        EfficientNet::seeded(&config, 11).unwrap()
    }

    fn input() -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 64, 64), |(_, c, y, x)| ((c * 7 + y * 3 + x) % 11) as f32 / 10.0)
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let net = net();
        let (_, mut tape) = net.forward_captured(input().view()).unwrap();
        let class = 2;
        let grad = tape.backward(class).unwrap().to_owned();

        // Perturb one activation and rerun only the head.
        let score = |activation: &Array3<f32>| {
            let (c, h, w) = activation.dim();
            let data: Vec<f32> = activation.iter().copied().collect();
            let features = Tensor::from_vec(data, (1, c, h, w), &Device::Cpu).unwrap();
            let logits = net.head(&features).unwrap();
            logits.i((0, class)).unwrap().to_scalar::<f32>().unwrap()
        };
        let base = tape.activation().to_owned();
        let h = 1e-2;
        for idx in [(0, 0, 0), (17, 1, 0), (1279, 1, 1)] {
            let mut plus = base.clone();
            plus[idx] += h;
            let mut minus = base.clone();
            minus[idx] -= h;
            let numeric = (score(&plus) - score(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad[idx], numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_backward_does_not_accumulate() {
        let net = net();
        let (_, mut tape) = net.forward_captured(input().view()).unwrap();
        let first = tape.backward(1).unwrap().to_owned();
        tape.backward(4).unwrap();
        let again = tape.backward(1).unwrap().to_owned();
        assert_abs_diff_eq!(first, again, epsilon = 1e-7);
        assert!(first.iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_out_of_range_class_is_rejected() {
        let net = net();
        let (_, mut tape) = net.forward_captured(input().view()).unwrap();
        assert!(matches!(tape.backward(5), Err(ModelError::Inference(_))));
    }
}
