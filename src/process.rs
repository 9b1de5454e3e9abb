//! Inference in a child `retigrade infer` process.

use retigrade_helpers::{PipelineError, Stage};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::debug;
use training_session::{Analysis, AnalysisRequest, InferenceEngine};

use crate::envelope::{InferenceEnvelope, read_heatmap_png};

/// Engine that runs every analysis in a separate `retigrade infer` process
/// and reads its JSON envelope back.
///
/// A non-zero exit status or any output on stderr fails the analysis with
/// [`PipelineError::Inference`].
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Argument placed before the `infer` subcommand, such as `--config`.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self, image: &Path, heatmap: &Path, request: &AnalysisRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("infer")
            .arg(image)
            .arg("--heatmap")
            .arg(heatmap)
            .stdin(Stdio::null());
        if !request.with_saliency {
            command.arg("--no-saliency");
        }
        if let Some(class) = request.class {
            command.arg("--class").arg(class.index().to_string());
        }
        command
    }
}

impl InferenceEngine for ProcessEngine {
    fn analyse(&self, image: &Path, request: &AnalysisRequest) -> Result<Analysis, PipelineError> {
        let started = Instant::now();
        let heatmap = tempfile::Builder::new()
            .prefix("retigrade-heatmap-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| PipelineError::Inference(format!("cannot create heatmap file: {e}")))?;
        let output = self
            .command(image, heatmap.path(), request)
            .output()
            .map_err(|e| PipelineError::Inference(format!("failed to run {}: {e}", self.program.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !output.status.success() {
            return Err(PipelineError::Inference(format!(
                "{} exited with {}: {stderr}",
                self.program.display(),
                output.status
            )));
        }
        if !stderr.is_empty() {
            return Err(PipelineError::Inference(format!(
                "{} reported: {stderr}",
                self.program.display()
            )));
        }

        let envelope: InferenceEnvelope = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Inference(format!("malformed inference envelope: {e}")))?;
        let analysis = envelope_to_analysis(envelope)?;
        debug!(
            image = %image.display(),
            stage = analysis.stage.index(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "child analysis finished"
        );
        Ok(analysis)
    }

    fn name(&self) -> String {
        format!("{} (subprocess)", self.program.display())
    }
}

fn envelope_to_analysis(envelope: InferenceEnvelope) -> Result<Analysis, PipelineError> {
    let stage = Stage::try_from(envelope.stage_id).map_err(PipelineError::Inference)?;
    if envelope.probs.iter().any(|p| !p.is_finite()) {
        return Err(PipelineError::Inference("envelope carries non-finite probabilities".into()));
    }
    let saliency = match &envelope.heatmap {
        Some(path) => Some(
            read_heatmap_png(path)
                .map_err(|e| PipelineError::Inference(format!("unreadable saliency map: {e}")))?,
        ),
        None => None,
    };
    Ok(Analysis {
        stage,
        probs: envelope.probs,
        p_max: envelope.p_max,
        saliency,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable shell script standing in for the binary.
    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-retigrade");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const ENVELOPE: &str = r#"{"stage_id":2,"p_max":0.6,"probs":[0.1,0.1,0.6,0.1,0.1],"heatmap":null}"#;

    #[test]
    fn test_envelope_on_stdout_becomes_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(script(dir.path(), &format!("echo '{ENVELOPE}'")));
        let analysis = engine
            .analyse(Path::new("fundus.png"), &AnalysisRequest::prediction_only())
            .unwrap();
        assert_eq!(analysis.stage.index(), 2);
        assert_eq!(analysis.probs, [0.1, 0.1, 0.6, 0.1, 0.1]);
        assert!(analysis.saliency.is_none());
    }

    #[test]
    fn test_arguments_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args.txt");
        let body = format!("echo \"$@\" > {}\necho '{ENVELOPE}'", log.display());
        let engine = ProcessEngine::new(script(dir.path(), &body)).arg("--config").arg("run.json");
        let request = AnalysisRequest {
            class: Stage::new(4),
            with_saliency: false,
        };
        engine.analyse(Path::new("fundus.png"), &request).unwrap();
        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.starts_with("--config run.json infer fundus.png --heatmap "));
        assert!(args.trim_end().ends_with("--no-saliency --class 4"));
    }

    #[test]
    fn test_non_zero_exit_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(script(dir.path(), "echo 'error: model load failed' >&2\nexit 1"));
        let err = engine.analyse(Path::new("fundus.png"), &AnalysisRequest::default()).unwrap_err();
        assert!(matches!(&err, PipelineError::Inference(msg) if msg.contains("model load failed")));
    }

    #[test]
    fn test_stderr_output_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("echo 'warning: degraded' >&2\necho '{ENVELOPE}'");
        let engine = ProcessEngine::new(script(dir.path(), &body));
        let err = engine.analyse(Path::new("fundus.png"), &AnalysisRequest::default()).unwrap_err();
        assert!(matches!(&err, PipelineError::Inference(msg) if msg.contains("degraded")));
    }

    #[test]
    fn test_malformed_stdout_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(script(dir.path(), "echo 'stage: 2'"));
        let err = engine.analyse(Path::new("fundus.png"), &AnalysisRequest::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_out_of_range_stage_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"echo '{"stage_id":7,"p_max":0.6,"probs":[0.1,0.1,0.6,0.1,0.1]}'"#;
        let engine = ProcessEngine::new(script(dir.path(), body));
        let err = engine.analyse(Path::new("fundus.png"), &AnalysisRequest::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_missing_program_is_inference_error() {
        let engine = ProcessEngine::new("/nonexistent/retigrade");
        let err = engine.analyse(Path::new("fundus.png"), &AnalysisRequest::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }
}
