//! Vigil CLI
//!
//! The `vigil` command runs anomaly models through the engine: fitting,
//! evaluation, prediction and export, plus synthetic dataset generation.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::types::{DatagenArgs, ExportArgs, RunArgs};
use commands::{datagen, models, run};

/// Vigil - anomaly detection training and evaluation
#[derive(Parser, Debug)]
#[command(name = "vigil", author, version, about = "Vigil - anomaly detection models, end to end")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model and validate it, writing `weights/last.ckpt`
    Fit(RunArgs),

    /// Evaluate on the test split
    Test(RunArgs),

    /// Fit, then test
    Train(RunArgs),

    /// Evaluate on the validation split, refitting thresholds
    Validate(RunArgs),

    /// Score the predict split
    Predict(RunArgs),

    /// Write a deployable model bundle
    Export(ExportArgs),

    /// List available models
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a synthetic dataset
    Datagen(DatagenArgs),
}

fn log_level(name: &str) -> Level {
    match name {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `--json` output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&args.log_level))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Fit(run_args) => run::execute(run::Stage::Fit, run_args).await,
        Command::Test(run_args) => run::execute(run::Stage::Test, run_args).await,
        Command::Train(run_args) => run::execute(run::Stage::Train, run_args).await,
        Command::Validate(run_args) => run::execute(run::Stage::Validate, run_args).await,
        Command::Predict(run_args) => run::execute(run::Stage::Predict, run_args).await,
        Command::Export(export_args) => run::execute(run::Stage::Export(export_args.format), export_args.run).await,
        Command::Models { json } => models::execute(json),
        Command::Datagen(datagen_args) => datagen::execute(&datagen_args),
    }
}
