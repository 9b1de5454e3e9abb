use std::path::Path;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use image::{GrayImage, Luma, Rgb, RgbImage};
use retigrade::envelope::{InferenceEnvelope, mask_from_png, read_heatmap_png, write_heatmap_png};
use retigrade::grad_cam::{save_weights, seeded_weights};
use retigrade::helpers::ModelConfig;
use retigrade::session::{
    AnalysisRequest, HistorySummary, InferenceEngine, InferenceWorker, LocalEngine, RoundStep,
    TrainingRound,
};
use retigrade::{PipelineConfig, PipelineError, Stage};

fn small_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.model = ModelConfig {
        input_size: 64,
        ..ModelConfig::default()
    };
    config.artifacts.weights = dir.join("best_cls.safetensors");
    config
}

fn write_weights(config: &PipelineConfig, seed: u64) {
    save_weights(&seeded_weights(seed).unwrap(), &config.artifacts.weights).unwrap();
}

/// Synthetic fundus: dark background with a bright lesion off-centre.
fn write_fundus(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("fundus.png");
    RgbImage::from_fn(120, 100, |x, y| {
        let dx = x as f32 - 80.0;
        let dy = y as f32 - 30.0;
        let lesion = (-(dx * dx + dy * dy) / 120.0).exp();
        Rgb([(60.0 + 190.0 * lesion) as u8, (30.0 + 120.0 * lesion) as u8, 20])
    })
    .save(&path)
    .unwrap();
    path
}

#[test]
fn stand_alone_inference_produces_envelope_and_heatmap() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    write_weights(&config, 1);
    let image = write_fundus(dir.path());

    let engine = Arc::new(LocalEngine::load(&config).unwrap());
    let analysis = InferenceWorker::spawn(engine, image, AnalysisRequest::default(), 0)
        .unwrap()
        .wait()
        .unwrap();

    assert_abs_diff_eq!(analysis.probs.iter().sum::<f32>(), 1.0, epsilon = 1e-4);
    let saliency = analysis.saliency.clone().unwrap();
    assert_eq!(saliency.dim(), (64, 64));
    assert!(saliency.iter().all(|&v| (0.0..=1.0).contains(&v)));

    let heatmap = dir.path().join("heatmap.png");
    write_heatmap_png(saliency.view(), &heatmap).unwrap();
    let back = read_heatmap_png(&heatmap).unwrap();
    assert_eq!(back.dim(), (64, 64));
    for (&a, &b) in saliency.iter().zip(back.iter()) {
        assert!(a - b >= -1e-6 && a - b < 1.0 / 255.0 + 1e-6);
    }

    let envelope = InferenceEnvelope::from_analysis(&analysis, Some(heatmap));
    assert_eq!(usize::from(envelope.stage_id), analysis.stage.index());
    assert_eq!(envelope.p_max, analysis.probs[analysis.stage.index()]);
}

#[test]
fn full_training_round_from_mask_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    write_weights(&config, 2);
    let image = write_fundus(dir.path());

    let mask_path = dir.path().join("mask.png");
    GrayImage::from_fn(60, 50, |x, y| Luma([if (30..50).contains(&x) && (5..25).contains(&y) { 255 } else { 0 }]))
        .save(&mask_path)
        .unwrap();
    let annotation = mask_from_png(&mask_path).unwrap();

    let engine: Arc<dyn InferenceEngine> = Arc::new(LocalEngine::load(&config).unwrap());
    let mut round = TrainingRound::from_config(&config);
    round.start(&image).unwrap();
    assert_eq!(round.canvas().map(|c| (c.width(), c.height())), Some((120, 100)));
    round.canvas_mut().unwrap().overlay(annotation.view()).unwrap();
    round.select_stage(Stage::ALL[1]).unwrap();
    round.confirm_focus().unwrap();
    round.request_analysis(engine.clone()).unwrap();
    assert_eq!(round.request_analysis(engine), Err(PipelineError::Busy));
    let outcome = round.wait().unwrap();

    assert_eq!(round.step(), RoundStep::Finished);
    assert_eq!(outcome.ai_mask.dim(), (64, 64));
    assert!((1..=5).contains(&outcome.record.score));
    assert!((0.0..=1.0).contains(&outcome.record.dice));
    assert_eq!(outcome.record.ai_stage, outcome.analysis.stage);
    assert_eq!(
        outcome.card.stage_sub,
        5 - Stage::ALL[1].distance(outcome.analysis.stage).min(4) as u8
    );

    let json = serde_json::to_value(&outcome.record).unwrap();
    assert_eq!(json["user_stage"], 1);
    let summary = HistorySummary::from_records(std::slice::from_ref(&outcome.record));
    assert_eq!(summary.total, 1);
    assert_eq!(summary.target_level, Some(outcome.record.score));
}

#[test]
fn missing_weights_fail_before_any_round() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    assert!(matches!(LocalEngine::load(&config), Err(PipelineError::ModelLoad(_))));
}

#[test]
fn weights_for_another_architecture_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    let mut tensors = seeded_weights(3).unwrap();
    tensors.remove("classifier.weight");
    tensors.remove("classifier.bias");
    save_weights(&tensors, &config.artifacts.weights).unwrap();
    let err = LocalEngine::load(&config).unwrap_err();
    assert!(matches!(&err, PipelineError::ModelLoad(msg) if msg.contains("classifier")));
}
