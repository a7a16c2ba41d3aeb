//! Engine stage commands: fit, test, train, validate, predict, export.

use crate::commands::types::RunArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use vigil_core::batch::{IMAGE_PATH, PRED_LABELS, PRED_SCORES, VIDEO_PATH};
use vigil_core::{BatchExt, StepOutput};
use vigil_engine::{get_datamodule, DataOptions, Engine, EngineConfig, ExportType, Metrics, ModelCheckpoint};
use vigil_models::{get_model, ModelArgs, ModelType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Test,
    Train,
    Validate,
    Predict,
    Export(ExportType),
}

impl Stage {
    const fn label(self) -> &'static str {
        match self {
            Self::Fit => "Fit",
            Self::Test => "Test",
            Self::Train => "Train",
            Self::Validate => "Validate",
            Self::Predict => "Predict",
            Self::Export(_) => "Export",
        }
    }
}

enum Outcome {
    Metrics(Metrics),
    Predictions(Vec<StepOutput>),
    Exported(PathBuf),
}

/// Runs `stage` on a blocking thread; Ctrl-C cancels it between batches.
pub async fn execute(stage: Stage, args: RunArgs) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let json_output = args.json;
    let mut task = tokio::task::spawn_blocking(move || run_stage(stage, &args, flag));

    let outcome = tokio::select! {
        joined = &mut task => joined.context("engine task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received; stopping after the current batch");
            cancel.store(true, Ordering::SeqCst);
            task.await.context("engine task panicked")??
        }
    };
    print_outcome(stage, &outcome, json_output)
}

fn load_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.root {
        config.default_root_dir.clone_from(root);
    }
    if let Some(task) = args.task {
        config.task = task;
    }
    Ok(config)
}

fn run_stage(stage: Stage, args: &RunArgs, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    let config = load_config(args)?;
    let model_type: ModelType = args.model.parse()?;

    let mut model_args = ModelArgs { input_size: args.input_size, n_pca_components: args.n_pca_components };
    if model_type == ModelType::PcaDensity && model_args.n_pca_components.is_none() {
        model_args.n_pca_components = Some(2);
    }
    let mut model = get_model(&args.model, &model_args).context("Failed to build model")?;

    let datamodule_name = args
        .datamodule
        .clone()
        .unwrap_or_else(|| if model_type.is_video() { "clips" } else { "folder" }.to_string());
    let options = DataOptions {
        category: args.category.clone(),
        task: config.task,
        image_size: args.input_size,
        train_batch_size: config.train_batch_size,
        eval_batch_size: config.eval_batch_size,
        ..DataOptions::default()
    };
    let mut datamodule = get_datamodule(&datamodule_name, &args.data, options)
        .with_context(|| format!("Failed to open dataset {}", args.data.display()))?;

    let mut engine = Engine::new(config).with_cancel_flag(cancel);
    let layout = engine.layout();
    let ckpt = args.ckpt.clone().or_else(|| {
        let last = layout.last_checkpoint_path();
        (stage != Stage::Fit && stage != Stage::Train && last.exists()).then(|| {
            info!(path = %last.display(), "Using last checkpoint");
            last
        })
    });
    if matches!(stage, Stage::Fit | Stage::Train) {
        engine = engine.with_callback(ModelCheckpoint::new(layout.weights_dir()));
    }

    let (model, datamodule, ckpt) = (model.as_mut(), datamodule.as_mut(), ckpt.as_deref());
    let outcome = match stage {
        Stage::Fit => Outcome::Metrics(engine.fit(model, datamodule)?),
        Stage::Test => Outcome::Metrics(engine.test(model, datamodule, ckpt)?),
        Stage::Train => Outcome::Metrics(engine.train(model, datamodule, ckpt)?),
        Stage::Validate => Outcome::Metrics(engine.validate(model, datamodule, ckpt)?),
        Stage::Predict => Outcome::Predictions(engine.predict(model, datamodule, ckpt)?),
        Stage::Export(export_type) => {
            Outcome::Exported(engine.export(model, datamodule, ckpt, export_type, args.input_size)?)
        }
    };
    Ok(outcome)
}

/// One row per sample: `(path, score, label)`.
fn prediction_rows(outputs: &[StepOutput]) -> Vec<(String, f32, bool)> {
    let mut rows = Vec::new();
    for output in outputs {
        let paths = output.text(IMAGE_PATH).or_else(|_| output.text(VIDEO_PATH)).unwrap_or_default();
        let (Ok(scores), Ok(labels)) = (output.tensor(PRED_SCORES), output.tensor(PRED_LABELS)) else {
            continue;
        };
        for (i, (score, label)) in scores.data.iter().zip(&labels.data).enumerate() {
            let path = paths.get(i).cloned().unwrap_or_else(|| format!("#{}", rows.len()));
            rows.push((path, *score, *label > 0.5));
        }
    }
    rows
}

fn print_outcome(stage: Stage, outcome: &Outcome, json_output: bool) -> Result<()> {
    match outcome {
        Outcome::Metrics(metrics) => {
            if json_output {
                println!("{}", serde_json::to_string_pretty(metrics)?);
                return Ok(());
            }
            println!();
            println!("{}", format!("{} metrics", stage.label()).bold().cyan());
            if metrics.is_empty() {
                println!("  {}", "No metrics computed.".dimmed());
            }
            for (name, value) in metrics {
                println!("  {:<20} {:.4}", name, value);
            }
            println!();
        }
        Outcome::Predictions(outputs) => {
            let rows = prediction_rows(outputs);
            if json_output {
                let out: Vec<_> = rows
                    .iter()
                    .map(|(path, score, anomalous)| json!({"path": path, "score": score, "anomalous": anomalous}))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            println!();
            println!("{}", format!("Predictions ({})", rows.len()).bold().cyan());
            println!("{:<60} {:>8} Label", "Path", "Score");
            println!("{}", "─".repeat(76));
            for (path, score, anomalous) in rows {
                let label = if anomalous { "anomalous".red() } else { "normal".green() };
                println!("{:<60} {:>8.4} {}", path, score, label);
            }
            println!();
        }
        Outcome::Exported(path) => {
            if json_output {
                println!("{}", serde_json::to_string_pretty(&json!({"path": path}))?);
                return Ok(());
            }
            println!();
            println!("{}", "Export complete".bold().green());
            println!("  Bundle: {}", path.display().to_string().cyan());
            println!();
        }
    }
    Ok(())
}
