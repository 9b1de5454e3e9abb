use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use retigrade::ProcessEngine;
use retigrade::grad_cam::{save_weights, seeded_weights};
use retigrade::helpers::ModelConfig;
use retigrade::session::{AnalysisRequest, InferenceEngine, LocalEngine, TrainingRound};
use retigrade::{PipelineConfig, PipelineError, Stage};

/// Weights, a config file pointing at them and a fundus image in `dir`.
fn setup(dir: &Path) -> (PipelineConfig, PathBuf, PathBuf) {
    let mut config = PipelineConfig::default();
    config.model = ModelConfig {
        input_size: 64,
        ..ModelConfig::default()
    };
    config.artifacts.weights = dir.join("best_cls.safetensors");
    save_weights(&seeded_weights(21).unwrap(), &config.artifacts.weights).unwrap();

    let config_path = dir.join("retigrade.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let image = dir.join("fundus.png");
    RgbImage::from_fn(90, 70, |x, y| {
        let dx = x as f32 - 30.0;
        let dy = y as f32 - 40.0;
        let lesion = (-(dx * dx + dy * dy) / 90.0).exp();
        Rgb([(50.0 + 200.0 * lesion) as u8, (25.0 + 100.0 * lesion) as u8, 15])
    })
    .save(&image)
    .unwrap();
    (config, config_path, image)
}

fn child(config_path: &Path) -> ProcessEngine {
    ProcessEngine::new(env!("CARGO_BIN_EXE_retigrade"))
        .arg("--config")
        .arg(config_path)
}

#[test]
fn child_process_matches_in_process_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let (config, config_path, image) = setup(dir.path());

    let local = LocalEngine::load(&config).unwrap().analyse(&image, &AnalysisRequest::default()).unwrap();
    let remote = child(&config_path).analyse(&image, &AnalysisRequest::default()).unwrap();

    assert_eq!(remote.stage, local.stage);
    for (a, b) in remote.probs.iter().zip(local.probs.iter()) {
        assert!((a - b).abs() < 1e-5);
    }
    let (remote_map, local_map) = (remote.saliency.unwrap(), local.saliency.unwrap());
    assert_eq!(remote_map.dim(), (64, 64));
    for (&r, &l) in remote_map.iter().zip(local_map.iter()) {
        assert!(l - r >= -1e-6 && l - r < 1.0 / 255.0 + 1e-6);
    }
}

#[test]
fn child_process_honours_prediction_only_and_class() {
    let dir = tempfile::tempdir().unwrap();
    let (_, config_path, image) = setup(dir.path());
    let engine = child(&config_path);

    let quick = engine.analyse(&image, &AnalysisRequest::prediction_only()).unwrap();
    assert!(quick.saliency.is_none());

    let request = AnalysisRequest {
        class: Stage::new(3),
        with_saliency: true,
    };
    let explained = engine.analyse(&image, &request).unwrap();
    assert_eq!(explained.probs, quick.probs);
    assert!(explained.saliency.is_some());
}

#[test]
fn child_process_failure_is_inference_error() {
    let dir = tempfile::tempdir().unwrap();
    let (_, config_path, image) = setup(dir.path());
    let engine = child(&config_path).arg("--weights").arg(dir.path().join("missing.pt"));
    let err = engine.analyse(&image, &AnalysisRequest::default()).unwrap_err();
    assert!(matches!(&err, PipelineError::Inference(msg) if msg.contains("not found")));
}

#[test]
fn training_round_runs_on_child_process() {
    let dir = tempfile::tempdir().unwrap();
    let (config, config_path, image) = setup(dir.path());
    let engine: Arc<dyn InferenceEngine> = Arc::new(child(&config_path));

    let mut round = TrainingRound::from_config(&config);
    round.start(&image).unwrap();
    let canvas = round.canvas_mut().unwrap();
    canvas.begin_stroke(30, 40);
    canvas.extend_stroke(36, 44);
    canvas.end_stroke();
    round.select_stage(Stage::ALL[2]).unwrap();
    round.confirm_focus().unwrap();
    round.request_analysis(engine).unwrap();
    let outcome = round.wait().unwrap();
    assert!((1..=5).contains(&outcome.record.score));
    assert_eq!(outcome.ai_mask.dim(), (64, 64));
}
