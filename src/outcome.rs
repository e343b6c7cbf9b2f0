//! Execution results.
//!
//! Every accepted task ends in exactly one [`ExecutionResult`]. Timeouts,
//! memory kills and launch failures are results, not errors: they are the
//! routine outcomes of running untrusted code.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exit code reported when the watchdog fired.
pub(crate) const EXIT_TIMED_OUT: i64 = -1;
/// Exit code reported when the engine itself failed the task.
pub(crate) const EXIT_EXECUTOR_ERROR: i64 = -3;
/// Exit code reported for out-of-memory kills (128 + SIGKILL).
pub(crate) const EXIT_OOM: i64 = 137;

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Termination {
    /// Exited on its own with code 0.
    Success,
    /// Exited on its own with a non-zero code: the user code failed.
    RuntimeError,
    /// Killed by the watchdog.
    TimedOut,
    /// Killed by the runtime's memory enforcement.
    ResourceKilled,
    /// The sandbox never started.
    LaunchFailed,
}

impl Termination {
    /// The process ran to its own exit (either `Success` or `RuntimeError`).
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::RuntimeError)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RuntimeError => write!(f, "runtime error"),
            Self::TimedOut => write!(f, "timed out"),
            Self::ResourceKilled => write!(f, "resource killed"),
            Self::LaunchFailed => write!(f, "launch failed"),
        }
    }
}

/// Captured result of one task. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExecutionResult {
    /// Submission id.
    pub id: String,
    /// Captured stdout.
    pub output: String,
    /// Captured stderr, or a fixed notice for engine-classified endings.
    pub error: String,
    /// Process exit code, or one of the `EXIT_*` sentinels.
    pub exit_code: i64,
    /// Termination classification.
    pub status: Termination,
}

impl ExecutionResult {
    /// The process exited on its own.
    pub fn completed(id: impl Into<String>, output: String, error: String, exit_code: i64) -> Self {
        let status = if exit_code == 0 {
            Termination::Success
        } else {
            Termination::RuntimeError
        };
        Self {
            id: id.into(),
            output,
            error,
            exit_code,
            status,
        }
    }

    /// The watchdog fired. Partial output is discarded.
    pub fn timed_out(id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            output: String::new(),
            error: format!("Execution timed out after {} seconds.", timeout.as_secs()),
            exit_code: EXIT_TIMED_OUT,
            status: Termination::TimedOut,
        }
    }

    /// The runtime killed the process for exceeding its memory ceiling.
    pub fn resource_killed(id: impl Into<String>, memory_limit: &str) -> Self {
        Self {
            id: id.into(),
            output: String::new(),
            error: format!("Process killed (likely out of memory > {memory_limit})."),
            exit_code: EXIT_OOM,
            status: Termination::ResourceKilled,
        }
    }

    /// The sandbox could not be started.
    pub fn launch_failed(id: impl Into<String>, cause: &dyn std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            output: String::new(),
            error: format!("Launch failed: {cause}"),
            exit_code: EXIT_EXECUTOR_ERROR,
            status: Termination::LaunchFailed,
        }
    }

    /// Supervision lost track of a started process.
    pub fn executor_error(id: impl Into<String>, cause: &dyn std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            output: String::new(),
            error: format!("Executor error: {cause}"),
            exit_code: EXIT_EXECUTOR_ERROR,
            status: Termination::RuntimeError,
        }
    }
}

/// Human-readable memory size for notices, e.g. `128m`.
pub(crate) fn format_memory(bytes: i64) -> String {
    const MIB: i64 = 1024 * 1024;
    const GIB: i64 = 1024 * MIB;
    if bytes % GIB == 0 {
        format!("{}g", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}m", bytes / MIB)
    } else {
        format!("{bytes}b")
    }
}
