//! Fixed-size worker pool providing global backpressure.
//!
//! The pool is a bounded semaphore: one [`WorkToken`] per global worker
//! slot. A token is held from item dispatch until outcome recording
//! completes, then freed unconditionally on drop, including on error paths
//! and task cancellation. This is the mechanism keeping concurrent backend
//! load at or below `max_workers`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, VolleyError};

/// Fixed set of execution slots shared by all batches.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool with `max_workers` slots.
    ///
    /// # Panics
    /// Panics if `max_workers` is zero.
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers > 0, "worker pool requires at least one slot");
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            capacity: max_workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a slot, suspending until one frees.
    pub async fn acquire(&self) -> Result<WorkToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VolleyError::Shutdown)?;
        Ok(self.token(permit))
    }

    /// Try to acquire a slot without waiting.
    pub fn try_acquire(&self) -> Option<WorkToken> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.token(permit))
    }

    fn token(&self, permit: OwnedSemaphorePermit) -> WorkToken {
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("volley_workers_in_flight").set(count as f64);
        WorkToken {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Ephemeral capacity unit for one global worker slot.
///
/// Never persisted; released exactly once when dropped. Holding the permit
/// inside the token makes double-release unrepresentable.
pub struct WorkToken {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for WorkToken {
    fn drop(&mut self) {
        let count = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("volley_workers_in_flight").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_respects_capacity() {
        let pool = WorkerPool::new(2);
        let t1 = pool.try_acquire().expect("first slot");
        let t2 = pool.try_acquire().expect("second slot");
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.available(), 0);

        drop(t1);
        assert_eq!(pool.in_flight(), 1);
        let _t3 = pool.try_acquire().expect("slot freed by drop");
        drop(t2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_slot_frees() {
        let pool = Arc::new(WorkerPool::new(1));
        let token = pool.acquire().await.unwrap();

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move { pool_clone.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        let token2 = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(pool.in_flight(), 1);
        drop(token2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_rejected() {
        WorkerPool::new(0);
    }
}
