use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clipcap::{LocalEngine, TrainConfig, TrainingOrchestrator};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "clipcap")]
#[command(about = "CLIP-prefix image captioning trainer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a training job
    Train {
        #[command(flatten)]
        config: TrainConfig,
    },

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config } => run_training(config)?,
        Commands::Config { file } => validate_config(file)?,
    }

    Ok(())
}

fn run_training(config: TrainConfig) -> Result<()> {
    info!("Starting clipcap training");

    let orchestrator =
        TrainingOrchestrator::new(config).context("Invalid training configuration")?;

    let mut engine = LocalEngine::new();
    let report = orchestrator
        .run(&mut engine)
        .context("Training run failed")?;

    info!(
        "Training finished: {} epochs, {} steps",
        report.epochs_completed, report.global_steps
    );
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    let config = TrainConfig::from_file(&file).context("Failed to load configuration file")?;

    println!("Configuration is valid");
    println!("  data source(s): {}", config.data_dirs().join(", "));
    println!("  output: {}", config.output_dir.display());
    println!(
        "  model: {} / {}",
        config.language_model_type, config.language_model_variant
    );
    Ok(())
}
