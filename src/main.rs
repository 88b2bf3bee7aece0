//! Command-line interface for the training loop.
//!
//! `train` runs a full multi-worker training job from a YAML configuration,
//! `vocab` checks the symbol table and `inspect` summarises a checkpoint.

#![recursion_limit = "256"]

use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use styletts_train::config::load_config;
use styletts_train::error::TrainError;
use styletts_train::perf;
use styletts_train::train::{train, TrainSummary};
use styletts_train::weights::CheckpointArchive;
use styletts_train::{Config, Vocabulary};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Supported compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// Use the WGPU backend (GPU acceleration when available).
    Wgpu,
    /// Use the ndarray backend (CPU).
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "styletts-train")]
#[command(about = "Second-stage StyleTTS training loop", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Train from a YAML configuration.
    Train {
        /// Training configuration YAML.
        #[arg(long, default_value = "Configs/config.yml")]
        config: PathBuf,
        /// Worker count; defaults to `num_workers` from the configuration.
        #[arg(long)]
        workers: Option<usize>,
        /// Compute backend to use.
        #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND)]
        backend: BackendChoice,
    },
    /// Print the token count of the configured symbol table.
    Vocab {
        /// Training configuration YAML.
        #[arg(long, default_value = "Configs/config.yml")]
        config: PathBuf,
    },
    /// Print metadata and per-module entry sizes of a checkpoint.
    Inspect {
        /// Checkpoint file.
        checkpoint: PathBuf,
    },
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    match cli.command {
        Commands::Train {
            config: config_path,
            workers,
            backend,
        } => {
            let config = load_config(&config_path)?;
            init_logging(Some(Path::new(&config.log_dir)))?;
            let workers = workers.unwrap_or(config.num_workers);
            let summary = match backend {
                BackendChoice::Wgpu => {
                    #[cfg(feature = "backend-wgpu")]
                    {
                        let device = WgpuDevice::default();
                        init_setup::<AutoGraphicsApi>(&device, Default::default());
                        train::<Autodiff<Wgpu>>(&config, &config_path, workers, &device)?
                    }
                    #[cfg(not(feature = "backend-wgpu"))]
                    {
                        anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
                    }
                }
                BackendChoice::Ndarray => {
                    let device = NdArrayDevice::default();
                    train::<Autodiff<NdArray<f32>>>(&config, &config_path, workers, &device)?
                }
            };
            print_summary(&summary);
        }
        Commands::Vocab { config } => {
            init_logging(None)?;
            let config = load_config(&config)?;
            let vocab = vocabulary(&config)?;
            println!("{}", vocab.n_token());
        }
        Commands::Inspect { checkpoint } => {
            init_logging(None)?;
            inspect(&checkpoint)?;
        }
    }

    if verbose {
        eprintln!("{}", perf::report());
    }
    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), mirrored to
/// `<log_dir>/train.log` when a log directory is given.
fn init_logging(log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("train.log"))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn vocabulary(config: &Config) -> Result<Vocabulary> {
    let symbol = config
        .symbol
        .as_ref()
        .ok_or_else(|| TrainError::missing("symbol"))?;
    Vocabulary::from_config(symbol)
}

fn inspect(path: &Path) -> Result<()> {
    let archive = CheckpointArchive::read(path)?;
    println!("epoch: {}", archive.meta.epoch);
    println!("iters: {}", archive.meta.iters);
    println!("val_loss: {}", archive.meta.val_loss);
    for (name, blob) in &archive.net {
        let optimizer = archive.optimizer.get(name).map(Vec::len).unwrap_or(0);
        println!("{name}: net {} bytes, optimizer {optimizer} bytes", blob.len());
    }
    Ok(())
}

fn print_summary(summary: &TrainSummary) {
    println!(
        "finished at epoch {} after {} steps ({} trained, {} skipped), best loss {}",
        summary.epoch,
        summary.iters,
        summary.trained_batches,
        summary.skipped_batches,
        summary.best_loss
    );
}
