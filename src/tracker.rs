//! Read-side batch lifecycle operations: status, listing, cancellation.

use std::sync::Arc;

use metrics::counter;
use tracing::info;

use crate::domain::batch::{Batch, BatchFilter, BatchId, BatchSnapshot};
use crate::domain::item::AnyItem;
use crate::error::Result;
use crate::store::RequestStore;

/// Queries and controls batches after admission.
pub struct LifecycleTracker<S> {
    store: Arc<S>,
}

impl<S: RequestStore> LifecycleTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Point-in-time status and counts for a batch.
    pub async fn get_status(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        self.store.snapshot(batch_id).await
    }

    /// List batch snapshots, newest first.
    pub async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<BatchSnapshot>> {
        self.store.list_batches(filter).await
    }

    /// All items of a batch with their per-item state and results.
    pub async fn get_results(&self, batch_id: BatchId) -> Result<Vec<AnyItem>> {
        self.store.batch_items(batch_id).await
    }

    /// Cancel a batch.
    ///
    /// Queued items are cancelled immediately; in-flight items drain and
    /// their outcomes are still recorded. Returns once the cancellation is
    /// durable, which may be before the drain finishes.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, batch_id: BatchId) -> Result<Batch> {
        let batch = self.store.cancel_batch(batch_id).await?;
        counter!("volley_batches_cancelled_total").increment(1);
        info!(
            batch_id = %batch.id,
            cancelled_items = batch.cancelled_items,
            "batch cancelled, in-flight items draining"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::BatchState;
    use crate::error::VolleyError;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_status_reflects_store_counts() {
        let store = Arc::new(MemoryStore::new());
        let batch = store
            .create_batch(vec![r#"{"p":1}"#.to_string(), r#"{"p":2}"#.to_string()], 4)
            .await
            .unwrap();
        let tracker = LifecycleTracker::new(store);

        let snapshot = tracker.get_status(batch.id).await.unwrap();
        assert_eq!(snapshot.status, BatchState::Pending);
        assert_eq!(snapshot.queued_items, 2);
        assert_eq!(snapshot.total_items, 2);
    }

    #[tokio::test]
    async fn test_cancel_then_status() {
        let store = Arc::new(MemoryStore::new());
        let batch = store
            .create_batch(vec![r#"{"p":1}"#.to_string()], 1)
            .await
            .unwrap();
        let tracker = LifecycleTracker::new(store);

        tracker.cancel(batch.id).await.unwrap();
        let snapshot = tracker.get_status(batch.id).await.unwrap();
        assert_eq!(snapshot.status, BatchState::Cancelled);
        assert_eq!(snapshot.cancelled_items, 1);

        // Cancel of an already-cancelled batch is rejected, state unchanged
        let err = tracker.cancel(batch.id).await.unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState { .. }));
        let snapshot = tracker.get_status(batch.id).await.unwrap();
        assert_eq!(snapshot.status, BatchState::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let tracker = LifecycleTracker::new(Arc::new(MemoryStore::new()));
        let err = tracker
            .get_status(BatchId::from(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::BatchNotFound(_)));
    }
}
