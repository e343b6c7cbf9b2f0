use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod archive;
mod commands;
mod config;
mod error;
mod executor;
mod history;
mod launcher;
mod outcome;
mod pool;
mod sandbox;
mod scheduler;
mod staging;
mod supervisor;
mod task;

use config::Config;

#[derive(Parser)]
#[command(name = "codebox")]
#[command(
    author,
    version,
    about = "Run untrusted Python and Node code in isolated Docker sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./codebox.toml if present)
    #[arg(long, global = true, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single code submission
    Run(commands::run::RunArgs),

    /// Run a batch of submissions from a JSON file
    Batch(commands::batch::BatchArgs),

    /// Run a multi-file project from a zip or tar archive
    RunArchive(commands::archive::ArchiveArgs),

    /// Show recent runs
    History(commands::history::HistoryArgs),

    /// Manage runtime images
    Image {
        #[command(subcommand)]
        action: commands::image::ImageAction,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref())?;
    let _log_guard = init_logging(cli.verbose, &config)?;

    let succeeded = match cli.command {
        Commands::Run(args) => commands::run::run(&config, args).await?,
        Commands::Batch(args) => commands::batch::run(&config, args).await?,
        Commands::RunArchive(args) => commands::archive::run(&config, args).await?,
        Commands::History(args) => {
            commands::history::run(&config, &args)?;
            true
        }
        Commands::Image { action } => {
            commands::image::run(&config, action).await?;
            true
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Logs go to stderr so stdout carries only program output. `RUST_LOG`
/// overrides the default filter.
fn init_logging(verbose: bool, config: &Config) -> Result<Option<WorkerGuard>> {
    let default_filter = if verbose {
        "codebox=debug"
    } else {
        "codebox=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, guard) = match &config.logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}
