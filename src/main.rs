//! CLI entry point for the ViT trainer.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vit_trainer_rs::data::{DataLoader, DatasetProfile, InMemoryDataset, Split};
use vit_trainer_rs::trainer::select_device;
use vit_trainer_rs::{
    predict_folder, RunConfig, RunMode, Trainer, TrainingSession, VisionTransformer, VitResult,
};

#[derive(Parser)]
#[command(name = "vit")]
#[command(about = "Train and run a Vision Transformer on CIFAR-10 or MNIST")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model or load the last checkpoint, then classify `inference_dir`
    Run {
        /// Path to configuration file
        #[arg(long, short)]
        config: PathBuf,
        /// Override the configured mode (train or load)
        #[arg(long)]
        mode: Option<RunMode>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Dataset profile (cifar10, mnist)
        #[arg(long, default_value = "cifar10")]
        dataset: DatasetProfile,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> VitResult<()> {
    match command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = RunConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Dataset: {}", config.dataset);
            println!("  Mode: {}", config.mode);
            println!("  Parameters: {}", config.model.parameter_count());
            println!("  Checkpoint: {}", config.checkpoint_path.display());
        }
        Commands::Run { config, mode } => {
            let mut config = RunConfig::from_file(&config)?;
            if let Some(mode) = mode {
                config.mode = mode;
            }
            config.validate()?;

            match config.mode {
                RunMode::Train => {
                    tracing::info!(
                        "Mode 'train': training {} from scratch, the checkpoint at {} will be overwritten",
                        config.dataset,
                        config.checkpoint_path.display()
                    );
                    train(&config)?;
                }
                RunMode::Load => {
                    tracing::info!(
                        "Mode 'load': skipping training and using the checkpoint at {}",
                        config.checkpoint_path.display()
                    );
                }
            }

            // Both modes finish on the best checkpoint
            let device = select_device();
            let model = VisionTransformer::load(&config.model, &config.checkpoint_path, &device)?;
            if let Some(dir) = config.inference_dir.as_deref() {
                classify(&config, &model, dir)?;
            }
            tracing::info!("Done!");
        }
        Commands::Init { output, dataset } => {
            tracing::info!("Generating config for dataset: {}", dataset);
            RunConfig::for_dataset(dataset).to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}

fn train(config: &RunConfig) -> VitResult<()> {
    let device = select_device();
    let profile = config.dataset;
    let training = &config.training;

    let train_set = InMemoryDataset::load(profile, &config.data_dir, Split::Train)?;
    let test_set = InMemoryDataset::load(profile, &config.data_dir, Split::Test)?;

    let mut train_loader = DataLoader::new(
        Box::new(train_set),
        profile.train_transforms_for(config.model.image_size),
        training.batch_size,
        true,
        device.clone(),
    );
    if let Some(seed) = training.seed {
        train_loader = train_loader.with_seed(seed.wrapping_add(1));
    }
    let mut test_loader = DataLoader::new(
        Box::new(test_set),
        profile.eval_transforms_for(config.model.image_size),
        training.batch_size,
        false,
        device.clone(),
    );

    let model = VisionTransformer::new(&config.model, &device)?;
    let mut trainer = Trainer::new(model, training.clone())?;
    let session = trainer.fit(
        TrainingSession::new(),
        &mut train_loader,
        &mut test_loader,
        &config.checkpoint_path,
    )?;

    let history = config.output_dir.join("history.json");
    session.save_json(&history)?;
    tracing::info!("Metric history saved to {}", history.display());
    Ok(())
}

fn classify(config: &RunConfig, model: &VisionTransformer, dir: &Path) -> VitResult<()> {
    let predictions = predict_folder(model, dir, config.dataset)?;

    let path = config.output_dir.join("predictions.json");
    write_json(&path, &predictions)?;
    tracing::info!(
        "{} predictions saved to {}",
        predictions.len(),
        path.display()
    );
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> VitResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
