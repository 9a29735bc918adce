//! tsbridge: offline tooling for time-series transfer runs.
//!
//! `check` validates a run configuration without touching any data.
//! `transform` converts a CSV file into `INSERT` statements without a
//! database connection.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tsbridge::RunConfig;
use tsbridge::error::{ConfigSnafu, PipelineError, TaskJoinSnafu};

/// Time-series file transfer tool.
#[derive(Parser, Debug)]
#[command(name = "tsbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a run configuration.
    Check {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Convert a CSV file into INSERT statements.
    Transform {
        /// CSV file to read.
        #[arg(short, long)]
        input: PathBuf,

        /// Statement file to write.
        #[arg(short, long)]
        output: PathBuf,

        /// Emit aligned inserts.
        #[arg(long)]
        aligned: bool,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Command::Check { config } => check(config),
        Command::Transform {
            input,
            output,
            aligned,
        } => {
            tokio::task::spawn_blocking(move || {
                tsbridge::transform_file(&input, &output, aligned)
            })
            .await
            .context(TaskJoinSnafu)??;
            Ok(())
        }
    }
}

fn check(path: PathBuf) -> Result<(), PipelineError> {
    let config = RunConfig::from_file(&path).context(ConfigSnafu)?;
    info!("Configuration is valid");
    info!("  Directory: {}", config.directory.display());
    info!("  Format: {}", config.format);
    info!("  Naming: {:?}", config.naming);
    info!("  Encoding: {}", config.encoding);
    info!("  Parallelism: {}", config.parallelism);
    info!("  Structure sidecar: {}", config.with_structure);
    Ok(())
}
