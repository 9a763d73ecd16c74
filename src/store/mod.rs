//! Request store trait for persisting batches and items.
//!
//! The store is the single source of truth for all batch/item state. Its two
//! atomic operations, [`RequestStore::claim_next_queued_item`] and
//! [`RequestStore::record_outcome`], are the only cross-worker coordination
//! points besides the worker pool's slot counter; both must be safe under
//! arbitrary concurrent invocation for the same batch.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::batch::{Batch, BatchFilter, BatchId, BatchSnapshot};
use crate::domain::item::{AnyItem, InFlight, Item, ItemId, ItemOutcome};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// An item touched by the stale-lease reclaim sweep.
#[derive(Debug, Clone)]
pub struct ReclaimedItem {
    pub item_id: ItemId,
    pub batch_id: BatchId,
    /// True if the item was returned to the queue; false if the reclaim cap
    /// was hit and the item was permanently failed (or cancelled because its
    /// batch already reached a terminal state).
    pub requeued: bool,
}

/// Durable CRUD for batches and items plus the two atomic dispatch
/// operations.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new batch and all of its items in one transaction.
    /// Either everything is stored or nothing is.
    async fn create_batch(&self, payloads: Vec<String>, concurrency_limit: usize)
        -> Result<Batch>;

    /// Get a batch record by ID.
    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch>;

    /// Point-in-time counts and status for a batch. Never blocks on
    /// in-flight work.
    async fn snapshot(&self, batch_id: BatchId) -> Result<BatchSnapshot>;

    /// List batch snapshots, newest first, with optional filtering.
    async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<BatchSnapshot>>;

    /// Get all items for a batch.
    async fn batch_items(&self, batch_id: BatchId) -> Result<Vec<AnyItem>>;

    /// Atomically claim one eligible queued item from the batch.
    ///
    /// Transitions the item to in-flight with a lease of `lease_ttl`, flips
    /// the batch from pending to running on the first claim, and returns the
    /// claimed item. Returns `None` when no eligible item exists — the queue
    /// is empty, every queued item is still inside its backoff gate, or the
    /// batch already has `concurrency_limit` items in flight. The per-batch
    /// ceiling is enforced here, never by caller discipline.
    ///
    /// # Errors
    /// `NotFound` for an unknown batch; `InvalidState` if the batch is
    /// terminal (callers must not retry the claim).
    async fn claim_next_queued_item(
        &self,
        batch_id: BatchId,
        lease_ttl: Duration,
    ) -> Result<Option<Item<InFlight>>>;

    /// Atomically record the outcome of an in-flight item.
    ///
    /// Transitions the item to succeeded or failed, bumps the batch
    /// counters, and re-derives the batch status in the same transaction.
    /// Returns the updated batch. A cancelled batch still accepts outcomes
    /// for items that were in flight when cancellation happened (in-flight
    /// work drains rather than being force-killed) but its status stays
    /// cancelled.
    ///
    /// # Errors
    /// `NotFound` for an unknown item; `InvalidState` if the item is not in
    /// flight or the batch settled through another terminal state.
    async fn record_outcome(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Batch>;

    /// Cancel a batch: immediately flips all queued items to cancelled and
    /// marks the batch cancelled. In-flight items are left to drain.
    ///
    /// # Errors
    /// `NotFound` for an unknown batch; `InvalidState` if the batch is
    /// already terminal (a second cancel is a no-op error, not corruption).
    async fn cancel_batch(&self, batch_id: BatchId) -> Result<Batch>;

    /// Mark a batch as failed after an unrecoverable store/backend error.
    /// Queued items are cancelled; in-flight items are left to drain.
    async fn fail_batch(&self, batch_id: BatchId, error: String) -> Result<Batch>;

    /// IDs of batches that currently have dispatchable work, ordered by
    /// creation time. Drives the scheduler's round-robin cursor.
    async fn active_batches(&self) -> Result<Vec<BatchId>>;

    /// Extend the leases of the given in-flight items. Items that are no
    /// longer in flight are skipped.
    async fn renew_leases(&self, item_ids: &[ItemId], lease_ttl: Duration) -> Result<()>;

    /// Sweep in-flight items whose lease has lapsed.
    ///
    /// Each stale item is returned to the queue for redispatch behind a
    /// `requeue_delay` backoff gate, or permanently failed once its attempt
    /// count reaches `max_attempts` (preventing infinite reclaim loops).
    /// Stale items of a batch that already reached a terminal state are
    /// settled as cancelled so the batch accounting still closes.
    async fn reclaim_expired(
        &self,
        max_attempts: u32,
        requeue_delay: Duration,
    ) -> Result<Vec<ReclaimedItem>>;
}
