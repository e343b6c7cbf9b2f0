//! Worker pool: the one counter shared by every in-flight task.
//!
//! Batch and single-task requests draw slots from the same pool, so total
//! sandbox concurrency is capped by a single number. Slots are handed out
//! first-come-first-served.

use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounded set of execution slots.
#[derive(Debug, Clone)]
pub(crate) struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

/// A held execution slot. Released on drop.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// Pool with `size` slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot.
    ///
    /// Only fails if the pool has been closed, which this crate never does.
    pub async fn acquire(&self) -> Result<PoolSlot, AcquireError> {
        let permit = Arc::clone(&self.slots).acquire_owned().await?;
        debug!(
            "Acquired pool slot ({}/{} free)",
            self.available(),
            self.size
        );
        Ok(PoolSlot { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
        assert_eq!(WorkerPool::new(5).size(), 5);
    }

    #[tokio::test]
    async fn test_slot_released_on_drop() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_when_full() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second slot should not be granted");

        drop(held);
        let granted = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_slots() {
        let pool = WorkerPool::new(1);
        let clone = pool.clone();
        let _held = pool.acquire().await.unwrap();
        assert_eq!(clone.available(), 0);
    }
}
