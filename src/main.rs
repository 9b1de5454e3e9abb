use clap::{ArgAction, Parser, Subcommand};
use grad_cam::{save_weights, seeded_weights};
use retigrade::ProcessEngine;
use retigrade::envelope::{InferenceEnvelope, mask_from_png, write_heatmap_png};
use retigrade_helpers::{PipelineConfig, PipelineError, Stage};
use scoring::ScoreCard;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info};
use training_session::{
    AnalysisRequest, InferenceEngine, InferenceWorker, LocalEngine, RoundRecord, TrainingRound,
};

#[derive(Parser)]
#[command(name = "retigrade", version, about = "Retinopathy stage grading practice")]
struct Cli {
    /// JSON configuration file; missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Classifier checkpoint (`.pt` state dict or `.safetensors`).
    #[arg(long, global = true)]
    weights: Option<PathBuf>,
    /// Optional ONNX export that supplies the probabilities.
    #[arg(long, global = true)]
    exported: Option<PathBuf>,
    /// Fraction of the most salient pixels forming the AI mask.
    #[arg(long, global = true)]
    top_frac: Option<f32>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify an image and print the inference envelope as JSON.
    Infer {
        image: PathBuf,
        /// Where to write the saliency map.
        #[arg(long, default_value = "heatmap.png")]
        heatmap: PathBuf,
        /// Only predict; skip the saliency backward pass.
        #[arg(long)]
        no_saliency: bool,
        /// Stage to explain instead of the predicted one.
        #[arg(long)]
        class: Option<u8>,
    },
    /// Grade a stage choice and annotation mask against the classifier.
    Grade {
        image: PathBuf,
        /// Annotation image; non-zero pixels are marked.
        #[arg(long)]
        mask: PathBuf,
        /// Stage chosen by the user (0-4).
        #[arg(long)]
        stage: u8,
        /// Run the classifier in a child `retigrade infer` process.
        #[arg(long)]
        isolated: bool,
    },
    /// Write a randomly initialised EfficientNet-B0 checkpoint.
    InitWeights {
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Serialize)]
struct GradeReport<'a> {
    record: &'a RoundRecord,
    card: &'a ScoreCard,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, retryable = err.is_retryable(), "retigrade failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, PipelineError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(weights) = &cli.weights {
        config.artifacts.weights = weights.clone();
    }
    if let Some(exported) = &cli.exported {
        config.artifacts.exported = Some(exported.clone());
    }
    if let Some(top_frac) = cli.top_frac {
        config.masks.top_frac = top_frac;
    }
    config.validate()?;
    Ok(config)
}

fn parse_stage(value: u8) -> Result<Stage, PipelineError> {
    Stage::try_from(value).map_err(PipelineError::Config)
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Infer {
            image,
            heatmap,
            no_saliency,
            class,
        } => {
            let request = AnalysisRequest {
                class: class.map(parse_stage).transpose()?,
                with_saliency: config.compute_saliency && !no_saliency,
            };
            let engine = Arc::new(LocalEngine::load(&config)?);
            let analysis = InferenceWorker::spawn(engine, image, request, 0)?.wait()?;
            let written = match &analysis.saliency {
                Some(saliency) => {
                    write_heatmap_png(saliency.view(), &heatmap)?;
                    Some(heatmap)
                }
                None => None,
            };
            print_json(&InferenceEnvelope::from_analysis(&analysis, written))
        }
        Command::Grade {
            image,
            mask,
            stage,
            isolated,
        } => {
            let user_stage = parse_stage(stage)?;
            let engine: Arc<dyn InferenceEngine> = if isolated {
                Arc::new(child_engine(cli.config.as_deref(), &config)?)
            } else {
                Arc::new(LocalEngine::load(&config)?)
            };
            let annotation = mask_from_png(&mask)?;

            let mut round = TrainingRound::from_config(&config);
            round.start(&image)?;
            round.canvas_mut()?.overlay(annotation.view())?;
            round.select_stage(user_stage)?;
            round.confirm_focus()?;
            round.request_analysis(engine)?;
            let outcome = round.wait()?;
            print_json(&GradeReport {
                record: &outcome.record,
                card: &outcome.card,
            })
        }
        Command::InitWeights { out, seed } => {
            save_weights(&seeded_weights(seed)?, &out)?;
            info!(path = %out.display(), seed, "wrote seeded weights");
            Ok(())
        }
    }
}

/// Engine that reruns this binary with the same configuration and resolved
/// artifact paths.
fn child_engine(config_path: Option<&Path>, config: &PipelineConfig) -> Result<ProcessEngine, PipelineError> {
    let exe = std::env::current_exe()
        .map_err(|e| PipelineError::Inference(format!("cannot locate the retigrade binary: {e}")))?;
    let mut engine = ProcessEngine::new(exe);
    if let Some(path) = config_path {
        engine = engine.arg("--config").arg(path);
    }
    engine = engine.arg("--weights").arg(&config.artifacts.weights);
    if let Some(exported) = &config.artifacts.exported {
        engine = engine.arg("--exported").arg(exported);
    }
    Ok(engine)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Inference(format!("failed to encode output: {e}")))?;
    println!("{text}");
    Ok(())
}
