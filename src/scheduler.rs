//! Batch scheduler.
//!
//! A batch is validated as a whole before anything runs, then every task is
//! spawned onto the runtime at once and left to queue on the shared worker
//! pool. Results come back in submission order regardless of finish order.

use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ValidationError;
use crate::executor::Executor;
use crate::outcome::ExecutionResult;
use crate::task::{validate_inline, Limits, RawRequest, TaskDescriptor};

/// Reject empty batches and batches over the cap.
pub(crate) fn check_batch_size(count: usize, max: usize) -> Result<(), ValidationError> {
    if count == 0 {
        return Err(ValidationError::EmptyBatch);
    }
    if count > max {
        return Err(ValidationError::batch_too_large(count, max));
    }
    Ok(())
}

/// Validate every request in a batch. The first failure rejects the batch.
///
/// Batch members run inline code only.
pub(crate) fn validate_batch(
    requests: Vec<RawRequest>,
    limits: &Limits,
    max_batch: usize,
) -> Result<Vec<TaskDescriptor>, ValidationError> {
    check_batch_size(requests.len(), max_batch)?;
    requests
        .into_iter()
        .map(|request| validate_inline(request, limits))
        .collect()
}

/// Run a validated batch. `results[i]` belongs to `tasks[i]`.
pub(crate) async fn run_batch(
    executor: &Arc<Executor>,
    tasks: Vec<TaskDescriptor>,
) -> Result<Vec<ExecutionResult>, ValidationError> {
    check_batch_size(tasks.len(), executor.max_batch())?;

    info!(
        "Running batch of {} tasks on {} workers",
        tasks.len(),
        executor.pool().size()
    );

    let mut ids = Vec::with_capacity(tasks.len());
    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        ids.push(task.id().to_string());
        let executor = Arc::clone(executor);
        handles.push(tokio::spawn(async move { executor.run(task).await }));
    }

    let results = join_all(handles)
        .await
        .into_iter()
        .zip(ids)
        .map(|(joined, id)| {
            joined.unwrap_or_else(|e| {
                warn!("Task {} aborted: {}", id, e);
                ExecutionResult::executor_error(id, &e)
            })
        })
        .collect();

    Ok(results)
}
