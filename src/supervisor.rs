//! Execution supervisor.
//!
//! Owns a launched sandbox until it ends:
//!
//! ```text
//! Launched -> Running -> { Completed | TimedOut | ResourceKilled } -> Finalized
//! (launch failure)     -> LaunchFailed                              -> Finalized
//! ```
//!
//! Output is drained on its own task for the whole life of the process, so a
//! chatty program can never block on a full pipe while the watchdog waits.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::outcome::{format_memory, ExecutionResult, EXIT_OOM};
use crate::pool::PoolSlot;
use crate::sandbox::{OutputChunk, OutputStream, SandboxProcess};
use crate::staging::StagingDir;
use crate::task::TaskDescriptor;

/// How long to keep reading output after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Lifecycle phases of one supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Launched,
    Running,
    Completed,
    TimedOut,
    ResourceKilled,
    LaunchFailed,
    Finalized,
}

/// Watches one sandbox at a time to a terminal state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Supervisor {
    max_output_bytes: usize,
    drain_grace: Duration,
}

impl Supervisor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            max_output_bytes,
            drain_grace: DRAIN_GRACE,
        }
    }

    /// Override how long output is read after exit.
    #[cfg(test)]
    fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Supervise `process` until it exits or the task's timeout fires.
    ///
    /// Never fails: every ending is turned into an [`ExecutionResult`].
    pub async fn supervise(
        &self,
        task: &TaskDescriptor,
        process: &mut dyn SandboxProcess,
    ) -> ExecutionResult {
        let limits = task.limits();
        transition(task, Phase::Launched);

        let mut drain = process
            .take_output()
            .map(|stream| Drain::spawn(stream, self.max_output_bytes));

        transition(task, Phase::Running);
        let waited = tokio::time::timeout(limits.timeout, process.wait()).await;

        match waited {
            Err(_) => {
                transition(task, Phase::TimedOut);
                warn!(
                    "Task {} exceeded {}s, killing sandbox {}",
                    task.id(),
                    limits.timeout.as_secs(),
                    process.id()
                );
                if let Err(e) = process.terminate().await {
                    warn!("Failed to kill sandbox {}: {:#}", process.id(), e);
                }
                if let Some(drain) = drain.take() {
                    drain.abort();
                }
                ExecutionResult::timed_out(task.id(), limits.timeout)
            }
            Ok(Err(e)) => {
                warn!("Lost track of sandbox {}: {:#}", process.id(), e);
                if let Err(e) = process.terminate().await {
                    warn!("Failed to kill sandbox {}: {:#}", process.id(), e);
                }
                if let Some(drain) = drain.take() {
                    drain.abort();
                }
                transition(task, Phase::Completed);
                ExecutionResult::executor_error(task.id(), &format!("{e:#}"))
            }
            Ok(Ok(status)) => {
                let captured = match drain.take() {
                    Some(drain) => drain.collect(self.drain_grace).await,
                    None => Captured::default(),
                };

                // Best effort: the runtime's OOM flag, or a SIGKILL exit the
                // watchdog did not cause
                if status.oom_killed || status.code == EXIT_OOM {
                    if !status.oom_killed {
                        warn!(
                            "Task {} exited with {} but the runtime reported no OOM kill; \
                             classifying as resource killed",
                            task.id(),
                            status.code
                        );
                    }
                    transition(task, Phase::ResourceKilled);
                    return ExecutionResult::resource_killed(
                        task.id(),
                        &format_memory(limits.memory_bytes),
                    );
                }

                transition(task, Phase::Completed);
                info!("Task {} exited with code {}", task.id(), status.code);
                ExecutionResult::completed(
                    task.id(),
                    captured.stdout_text(),
                    captured.stderr_text(),
                    status.code,
                )
            }
        }
    }
}

pub(crate) fn transition(task: &TaskDescriptor, phase: Phase) {
    debug!(task = task.id(), ?phase, "Task phase");
}

/// Bytes captured from one process, capped per stream.
#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

impl Captured {
    fn stdout_text(&self) -> String {
        render(&self.stdout, self.stdout_truncated)
    }

    fn stderr_text(&self) -> String {
        render(&self.stderr, self.stderr_truncated)
    }
}

fn render(bytes: &[u8], truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATED_MARKER);
    }
    text
}

/// Append up to the cap; anything past it is read and dropped.
fn append_capped(buf: &mut Vec<u8>, truncated: &mut bool, chunk: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    if chunk.len() > room {
        *truncated = true;
    }
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

fn lock(captured: &Mutex<Captured>) -> MutexGuard<'_, Captured> {
    captured.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read the output stream to its end into the shared buffer.
async fn drain(mut stream: OutputStream, cap: usize, shared: Arc<Mutex<Captured>>) {
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Error reading sandbox output: {:#}", e);
                break;
            }
        };

        let mut guard = lock(&shared);
        let captured = &mut *guard;
        match chunk {
            OutputChunk::Stdout(bytes) => append_capped(
                &mut captured.stdout,
                &mut captured.stdout_truncated,
                &bytes,
                cap,
            ),
            OutputChunk::Stderr(bytes) => append_capped(
                &mut captured.stderr,
                &mut captured.stderr_truncated,
                &bytes,
                cap,
            ),
        }
    }
}

/// Output drain running on its own task.
///
/// The buffer is shared with the task, so a drain cut short still hands back
/// everything it read. Dropping the handle stops the task.
struct Drain {
    handle: JoinHandle<()>,
    captured: Arc<Mutex<Captured>>,
}

impl Drain {
    fn spawn(stream: OutputStream, cap: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let handle = tokio::spawn(drain(stream, cap, Arc::clone(&captured)));
        Self { handle, captured }
    }

    fn abort(&self) {
        self.handle.abort();
    }

    /// Wait up to `grace` for end-of-stream, then return what was read.
    async fn collect(mut self, grace: Duration) -> Captured {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Output drain task failed: {}", e),
            Err(_) => {
                warn!("Output stream still open after exit; keeping what was read");
                self.handle.abort();
            }
        }
        std::mem::take(&mut *lock(&self.captured))
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Releases everything a task holds. Runs once; later calls do nothing.
///
/// Each held resource also cleans up on drop, which covers unwinding and
/// cancelled futures.
pub(crate) struct Finalizer {
    slot: Option<PoolSlot>,
    staging: Option<StagingDir>,
    process: Option<Box<dyn SandboxProcess>>,
    task_id: String,
    finalized: bool,
}

impl Finalizer {
    pub fn new(task_id: impl Into<String>, slot: PoolSlot) -> Self {
        Self {
            slot: Some(slot),
            staging: None,
            process: None,
            task_id: task_id.into(),
            finalized: false,
        }
    }

    /// Take ownership of the task's staging directory.
    pub fn hold_staging(&mut self, staging: StagingDir) -> &StagingDir {
        self.staging.insert(staging)
    }

    /// Take ownership of the launched process.
    pub fn hold_process(&mut self, process: Box<dyn SandboxProcess>) -> &mut dyn SandboxProcess {
        self.process.insert(process).as_mut()
    }

    #[allow(dead_code)] // Public API for callers
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Kill lingering processes, delete staging, release the pool slot.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate().await {
                warn!("Failed to clean up sandbox {}: {:#}", process.id(), e);
            }
        }
        if let Some(mut staging) = self.staging.take() {
            staging.close();
        }
        drop(self.slot.take());

        debug!(task = %self.task_id, phase = ?Phase::Finalized, "Task phase");
    }
}
