//! Single-task execution pipeline.
//!
//! `pool slot -> staging -> launch -> supervise -> finalize`, with every
//! held resource released on every path. Batches reuse this pipeline per
//! task through the scheduler.

use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::archive;
use crate::config::Config;
use crate::error::{LaunchError, PrepError};
use crate::history::{HistoryRecord, HistoryStore};
use crate::launcher::Launcher;
use crate::outcome::ExecutionResult;
use crate::pool::WorkerPool;
use crate::sandbox::Sandbox;
use crate::staging::StagingDir;
use crate::supervisor::{transition, Finalizer, Phase, Supervisor};
use crate::task::{TaskDescriptor, TaskSource};

/// Runs validated tasks in sandboxes under a shared concurrency cap.
pub(crate) struct Executor {
    launcher: Launcher,
    supervisor: Supervisor,
    pool: WorkerPool,
    history: Arc<dyn HistoryStore>,
    history_code_chars: usize,
    max_batch: usize,
    cancel: watch::Sender<bool>,
}

impl Executor {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        config: &Config,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            launcher: Launcher::new(sandbox, config),
            supervisor: Supervisor::new(config.limits.max_output_bytes),
            pool: WorkerPool::new(config.pool.max_workers),
            history,
            history_code_chars: config.history.max_code_chars,
            max_batch: config.pool.max_batch,
            cancel: watch::channel(false).0,
        }
    }

    /// Stop every running and queued task. Each one is finalized and
    /// reported as an executor error; tasks started afterwards never launch.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// The shared worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Largest batch accepted.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Run an inline task to completion.
    pub async fn run(&self, task: TaskDescriptor) -> ExecutionResult {
        let result = self.execute(&task, None).await;
        self.record(&task, task.summary(), &result).await;
        result
    }

    /// Extract `archive` and run the task's entry point from it.
    ///
    /// Preparation errors are returned to the caller; everything after
    /// extraction resolves to a result.
    pub async fn run_archive(
        &self,
        task: TaskDescriptor,
        archive: Vec<u8>,
        archive_name: &str,
    ) -> Result<ExecutionResult, PrepError> {
        let TaskSource::Project { entry } = task.source() else {
            return Err(PrepError::entry_point_not_found("<none>"));
        };

        let entry = entry.clone();
        let staging = tokio::task::spawn_blocking(move || archive::prepare(&archive, &entry))
            .await
            .map_err(|e| PrepError::Staging {
                source: io::Error::other(e),
            })??;

        let result = self.execute(&task, Some(staging)).await;
        let summary = format!("{} (from {archive_name})", task.summary());
        self.record(&task, summary, &result).await;
        Ok(result)
    }

    async fn execute(
        &self,
        task: &TaskDescriptor,
        staging: Option<StagingDir>,
    ) -> ExecutionResult {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            return interrupted(task);
        }

        let slot = tokio::select! {
            slot = self.pool.acquire() => match slot {
                Ok(slot) => slot,
                Err(e) => return ExecutionResult::executor_error(task.id(), &e),
            },
            () = cancelled(&mut cancel) => return interrupted(task),
        };

        info!(
            "Running task {} ({}) on {}",
            task.id(),
            task.language(),
            self.launcher.runtime_name()
        );

        let mut finalizer = Finalizer::new(task.id(), slot);
        let result = tokio::select! {
            result = self.drive(task, staging, &mut finalizer) => result,
            () = cancelled(&mut cancel) => interrupted(task),
        };
        finalizer.finalize().await;

        info!("Task {} finished: {}", task.id(), result.status);
        result
    }

    async fn drive(
        &self,
        task: &TaskDescriptor,
        staging: Option<StagingDir>,
        finalizer: &mut Finalizer,
    ) -> ExecutionResult {
        let staging = match staging {
            Some(staging) => staging,
            None => match self.launcher.stage_inline(task) {
                Ok(staging) => staging,
                Err(e) => return launch_failed(task, &e),
            },
        };

        let staging = finalizer.hold_staging(staging);
        let spec = match self.launcher.environment(task, staging) {
            Ok(spec) => spec,
            Err(e) => return launch_failed(task, &e),
        };

        let process = match self.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => return launch_failed(task, &e),
        };

        let process = finalizer.hold_process(process);
        self.supervisor.supervise(task, process).await
    }

    async fn record(&self, task: &TaskDescriptor, summary: String, result: &ExecutionResult) {
        let record = HistoryRecord::new(
            &task.language().to_string(),
            &summary,
            result,
            self.history_code_chars,
        );
        // File I/O and the store's lock stay off the async workers
        let history = Arc::clone(&self.history);
        match tokio::task::spawn_blocking(move || history.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to record history for task {}: {:#}", task.id(), e),
            Err(e) => warn!("History writer for task {} failed: {}", task.id(), e),
        }
    }
}

/// Resolves once cancellation is requested.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: nobody can cancel any more
        std::future::pending::<()>().await;
    }
}

fn interrupted(task: &TaskDescriptor) -> ExecutionResult {
    warn!("Task {} interrupted", task.id());
    ExecutionResult::executor_error(task.id(), &"interrupted before completion")
}

fn launch_failed(task: &TaskDescriptor, error: &LaunchError) -> ExecutionResult {
    transition(task, Phase::LaunchFailed);
    if error.is_image_not_found() {
        warn!(
            "Runtime image missing for {}; run `codebox image pull`",
            task.language()
        );
    } else if error.is_runtime_unavailable() {
        warn!("Docker became unreachable while launching task {}", task.id());
    }
    ExecutionResult::launch_failed(task.id(), error)
}
