//! actiondet CLI: argument parsing, logging setup and subcommand dispatch.
//!
//! The `actiondet` binary links no model backend. Programs that provide one
//! embed this crate and call [`run`] with their own [`Backend`].

mod commands;
mod unlinked;

pub use unlinked::UnlinkedBackend;

use actiondet_core::config::{ConfigOverrides, TrainOverrides};
use actiondet_core::procedures;
use actiondet_core::{Backend, Config, DatasetKind, load_config};
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// actiondet: train and evaluate spatio-temporal action detectors
#[derive(Parser, Debug)]
#[command(name = "actiondet", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Values that take precedence over the config file and environment.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct OverrideArgs {
    /// Dataset to train on (ucf24, jhmdb21, ava)
    #[arg(long, global = true, value_parser = parse_dataset)]
    pub dataset: Option<DatasetKind>,

    /// Checkpoint to resume from
    #[arg(long, global = true)]
    pub resume: Option<PathBuf>,

    /// Evaluate once and exit
    #[arg(long, global = true)]
    pub evaluate: bool,

    /// First epoch to run
    #[arg(long, global = true)]
    pub begin_epoch: Option<u32>,

    /// Last epoch to run (inclusive)
    #[arg(long, global = true)]
    pub end_epoch: Option<u32>,

    /// Directory for checkpoints and logs
    #[arg(long, global = true)]
    pub backup_dir: Option<PathBuf>,
}

impl OverrideArgs {
    pub fn to_config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            train: TrainOverrides {
                dataset: self.dataset,
                begin_epoch: self.begin_epoch,
                end_epoch: self.end_epoch,
                evaluate: self.evaluate.then_some(true),
                resume_path: self.resume.clone(),
            },
            backup_dir: self.backup_dir.clone(),
        }
    }
}

fn parse_dataset(s: &str) -> Result<DatasetKind, String> {
    s.parse().map_err(|e: actiondet_core::ConfigError| e.to_string())
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train (or evaluate once, with --evaluate)
    Train,
    /// Validate the configuration without building a model
    Check,
    /// Show the contents of a checkpoint file
    Inspect {
        /// Path to a checkpoint JSON file
        path: PathBuf,
    },
    /// Print the learning rate of every epoch in the configured range
    Schedule,
    /// Write a default configuration file
    Init {
        /// Where to write it
        #[arg(default_value = "actiondet.toml")]
        path: PathBuf,
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Install the global subscriber: human-readable progress on stdout, and
/// JSON lines in a daily rolling file when `log_dir` is given.
///
/// Returns the file writer's guard; dropping it flushes pending lines.
/// A subscriber that is already installed is left in place.
pub fn init_tracing(verbose: u8, quiet: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "actiondet.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(json_layer)
        .try_init();
    guard
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let overrides = cli.overrides.to_config_overrides();
    load_config(cli.config.as_deref(), Some(&overrides)).context("Configuration error")
}

/// Execute one parsed command line against `backend`.
pub fn run(cli: Cli, backend: &dyn Backend) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Train => {
            let config = load(&cli)?;
            // Reject unsupported datasets before the log directory exists.
            procedures::resolve(config.train.dataset)?;
            let _guard = init_tracing(
                cli.verbose,
                cli.quiet,
                Some(&config.backup_dir.join("logs")),
            );
            info!(
                config = ?cli.config,
                dataset = %config.train.dataset,
                "configuration loaded"
            );
            let summary = commands::train(config, backend)?;
            println!("{}", commands::render_summary(&summary));
            Ok(())
        }
        Commands::Check => {
            init_tracing(cli.verbose, cli.quiet, None);
            let config = load(&cli)?;
            println!("{}", commands::check(&config)?);
            Ok(())
        }
        Commands::Inspect { path } => {
            init_tracing(cli.verbose, cli.quiet, None);
            println!("{}", commands::inspect(path)?);
            Ok(())
        }
        Commands::Schedule => {
            init_tracing(cli.verbose, cli.quiet, None);
            let config = load(&cli)?;
            println!("{}", commands::schedule(&config));
            Ok(())
        }
        Commands::Init { path, force } => {
            init_tracing(cli.verbose, cli.quiet, None);
            commands::init(path, *force)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}
