use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use retigrade_helpers::{ModelConfig, NUM_STAGES};

use crate::ModelError;

/// A stage network that only runs forward, such as an ONNX export of the
/// trained classifier.
pub trait ExportedModel: Send + Sync {
    /// Raw stage logits for a `(1, 3, S, S)` input.
    fn logits(&self, input: ArrayView4<f32>) -> Result<[f32; NUM_STAGES], ModelError>;
}

/// ONNX Runtime session over an exported classifier graph.
pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    path: PathBuf,
}

fn open_session(path: &Path) -> ort::Result<Session> {
    Session::builder()?.commit_from_file(path)
}

impl OnnxModel {
    /// Opens the graph and runs one blank input through it, so a file that is
    /// not a five-way classifier for this input size fails at load time.
    pub fn load(path: &Path, config: &ModelConfig) -> Result<Self, ModelError> {
        if !path.is_file() {
            return Err(ModelError::Load(format!(
                "exported model {} not found",
                path.display()
            )));
        }
        let session = open_session(path).map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;
        let model = Self {
            session: Mutex::new(session),
            input_name: config.onnx_input.clone(),
            path: path.to_path_buf(),
        };
        let size = config.input_size;
        let blank = Array4::<f32>::zeros((1, 3, size, size));
        model
            .logits(blank.view())
            .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), input = %model.input_name, "loaded exported stage graph");
        Ok(model)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExportedModel for OnnxModel {
    fn logits(&self, input: ArrayView4<f32>) -> Result<[f32; NUM_STAGES], ModelError> {
        let owned = input.to_owned();
        let tensor = TensorRef::from_array_view(&owned).map_err(ModelError::inference)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::Inference("onnx session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(ModelError::inference)?;
        let (_, values) = outputs[0].try_extract_tensor::<f32>().map_err(ModelError::inference)?;
        <[f32; NUM_STAGES]>::try_from(values).map_err(|_| {
            ModelError::Inference(format!(
                "exported graph returned {} values, expected {NUM_STAGES}",
                values.len()
            ))
        })
    }
}
