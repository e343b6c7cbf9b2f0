//! CLI command implementations.
//!
//! Each submodule implements a codebox CLI command with pure formatting
//! separated from IO for testability. Submissions are validated before
//! Docker is contacted, so bad input fails fast without a daemon.

pub mod archive;
pub mod batch;
pub mod history;
pub mod image;
pub mod run;

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::executor::Executor;
use crate::history::{HistoryStore, JsonlHistory, NoopHistory};
use crate::outcome::{ExecutionResult, Termination};
use crate::sandbox::DockerSandbox;

/// Load config from `--config`, or `codebox.toml` in the current directory.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    }
}

/// History store selected by the `[history]` table.
pub(crate) fn history_store(config: &Config) -> Arc<dyn HistoryStore> {
    match config.history.resolved_path() {
        Some(path) if config.history.enabled => {
            debug!("Recording history to {}", path.display());
            Arc::new(JsonlHistory::new(path))
        }
        _ => Arc::new(NoopHistory),
    }
}

/// Connect to Docker and build an executor around it.
///
/// Ctrl-C cancels the executor, so running sandboxes are killed and removed
/// before the process exits.
pub(crate) async fn connect_executor(config: &Config) -> Result<Arc<Executor>> {
    let sandbox = DockerSandbox::connect()?;
    sandbox.ping().await?;
    let executor = Arc::new(Executor::new(
        Arc::new(sandbox),
        config,
        history_store(config),
    ));

    let watched = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping sandboxes");
            watched.cancel();
        }
    });

    Ok(executor)
}

/// One-line colored summary of a result, e.g. `✓ t1: success (exit 0)`.
pub(crate) fn format_status(result: &ExecutionResult) -> String {
    let label = format!("{} (exit {})", result.status, result.exit_code);
    let label = if result.status == Termination::Success {
        label.green()
    } else if result.status.is_completed() {
        label.yellow()
    } else {
        label.red()
    };
    let mark = if result.status == Termination::Success {
        "✓".green()
    } else {
        "✗".red()
    };
    format!("{mark} {}: {label}", result.id.cyan())
}

/// Print a result to the terminal: stdout to stdout, everything else to stderr.
pub(crate) fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
    }
    if !result.error.is_empty() {
        eprint!("{}", result.error.red());
        if !result.error.ends_with('\n') {
            eprintln!();
        }
    }
    eprintln!("{}", format_status(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_status_success() {
        colored::control::set_override(false);
        let result = ExecutionResult::completed("t1", "1\n".to_string(), String::new(), 0);
        assert_eq!(format_status(&result), "✓ t1: success (exit 0)");
    }

    #[test]
    fn test_format_status_timeout() {
        colored::control::set_override(false);
        let result = ExecutionResult::timed_out("t2", Duration::from_secs(10));
        assert_eq!(format_status(&result), "✗ t2: timed out (exit -1)");
    }

    #[test]
    fn test_history_store_disabled() {
        let mut config = Config::default();
        config.history.enabled = false;
        // NoopHistory accepts anything without touching disk
        let store = history_store(&config);
        let result = ExecutionResult::completed("t", String::new(), String::new(), 0);
        let record = crate::history::HistoryRecord::new("python", "x", &result, 10);
        assert!(store.record(&record).is_ok());
    }
}
