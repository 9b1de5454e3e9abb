use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use retigrade_helpers::ModelConfig;

use crate::ModelError;
use crate::efficientnet::{EfficientNet, parameter_shapes};

/// Loads the classifier from a checkpoint on disk.
///
/// `.safetensors` files and PyTorch `state_dict` pickles (`.pt`, `.pth`,
/// `.bin`) are accepted. Tensors are looked up by their timm names and must
/// have exactly the B0 shapes. Extra entries such as `num_batches_tracked` are
/// ignored.
pub fn load_weights(path: &Path, config: &ModelConfig) -> Result<EfficientNet, ModelError> {
    if !path.is_file() {
        return Err(ModelError::Load(format!(
            "weights file {} not found",
            path.display()
        )));
    }
    let device = Device::Cpu;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let vb = match extension {
        "safetensors" => {
            let bytes = std::fs::read(path)
                .map_err(|e| ModelError::Load(format!("failed to read {}: {e}", path.display())))?;
            VarBuilder::from_buffered_safetensors(bytes, DType::F32, &device)
        }
        "pt" | "pth" | "bin" => VarBuilder::from_pth(path, DType::F32, &device),
        other => {
            return Err(ModelError::Load(format!(
                "{}: unsupported weights format `{other}`",
                path.display()
            )));
        }
    }
    .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;

    let net = EfficientNet::load(vb, config).map_err(|e| match e {
        ModelError::Load(msg) => ModelError::Load(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    info!(path = %path.display(), input_size = config.input_size, "loaded stage classifier weights");
    Ok(net)
}

/// Randomly initialised B0 tensors, reproducible from `seed`.
///
/// Convolutions and the classifier are uniform in `±sqrt(6 / fan_in)` and
/// `±sqrt(1 / fan_in)` respectively. Batch norms start as the identity and
/// biases at zero.
pub fn seeded_weights(seed: u64) -> Result<HashMap<String, Tensor>, ModelError> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for (name, shape) in parameter_shapes() {
        let len: usize = shape.iter().product();
        let values: Vec<f32> = match shape.len() {
            1 if name.ends_with(".weight") || name.ends_with("running_var") => vec![1.0; len],
            1 => vec![0.0; len],
            rank => {
                let fan_in: usize = shape[1..].iter().product();
                let gain = if rank == 4 { 6.0 } else { 1.0 };
                let bound = (gain / fan_in as f32).sqrt();
                (0..len).map(|_| rng.random_range(-bound..bound)).collect()
            }
        };
        let tensor = Tensor::from_vec(values, shape, &device).map_err(ModelError::load)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Builds the network from in-memory tensors keyed by timm name.
pub fn from_tensors(tensors: HashMap<String, Tensor>, config: &ModelConfig) -> Result<EfficientNet, ModelError> {
    EfficientNet::load(VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu), config)
}

/// Writes `tensors` as a plain safetensors file that [`load_weights`] reads.
pub fn save_weights(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), ModelError> {
    candle_core::safetensors::save(tensors, path)
        .map_err(|e| ModelError::Load(format!("failed to write {}: {e}", path.display())))?;
    info!(path = %path.display(), tensors = tensors.len(), "saved stage classifier weights");
    Ok(())
}

impl EfficientNet {
    /// Randomly initialised network, reproducible from `seed`.
    pub fn seeded(config: &ModelConfig, seed: u64) -> Result<Self, ModelError> {
        from_tensors(seeded_weights(seed)?, config)
    }
}
