//! In-process request store.
//!
//! Every trait method runs inside one `parking_lot` critical section, which
//! is the transaction boundary: claim and outcome recording are
//! all-or-nothing, and batch counters can never be observed mid-update.
//! Durable backends plug in behind the same [`RequestStore`] trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::batch::{Batch, BatchFilter, BatchId, BatchSnapshot, BatchState};
use crate::domain::item::{
    AnyItem, FailureReason, InFlight, Item, ItemData, ItemId, ItemOutcome, Queued,
};
use crate::error::{Result, VolleyError};
use crate::store::{ReclaimedItem, RequestStore};

#[derive(Default)]
struct Inner {
    batches: HashMap<BatchId, Batch>,
    items: HashMap<ItemId, AnyItem>,
    /// Insertion-ordered item IDs per batch, for deterministic iteration.
    batch_items: HashMap<BatchId, Vec<ItemId>>,
}

impl Inner {
    fn batch(&self, batch_id: BatchId) -> Result<&Batch> {
        self.batches
            .get(&batch_id)
            .ok_or(VolleyError::BatchNotFound(batch_id))
    }

    fn in_flight_count(&self, batch_id: BatchId) -> u64 {
        self.batch_items
            .get(&batch_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| matches!(self.items.get(id), Some(AnyItem::InFlight(_))))
                    .count() as u64
            })
            .unwrap_or(0)
    }

    fn queued_count(&self, batch_id: BatchId) -> u64 {
        self.batch_items
            .get(&batch_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| matches!(self.items.get(id), Some(AnyItem::Queued(_))))
                    .count() as u64
            })
            .unwrap_or(0)
    }

    fn snapshot_of(&self, batch: &Batch) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: batch.id,
            status: batch.status,
            total_items: batch.total_items,
            queued_items: self.queued_count(batch.id),
            in_flight_items: self.in_flight_count(batch.id),
            completed_items: batch.completed_items,
            failed_items: batch.failed_items,
            cancelled_items: batch.cancelled_items,
            concurrency_limit: batch.concurrency_limit,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        }
    }
}

/// In-memory implementation of [`RequestStore`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create_batch(
        &self,
        payloads: Vec<String>,
        concurrency_limit: usize,
    ) -> Result<Batch> {
        let mut inner = self.inner.write();
        let batch = Batch::new(payloads.len() as u64, concurrency_limit);
        let mut ids = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let item = Item {
                state: Queued {
                    attempt_count: 0,
                    not_before: None,
                },
                data: ItemData {
                    id: ItemId::from(Uuid::new_v4()),
                    batch_id: batch.id,
                    payload,
                },
            };
            ids.push(item.data.id);
            inner.items.insert(item.data.id, item.into());
        }

        inner.batch_items.insert(batch.id, ids);
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        let inner = self.inner.read();
        inner.batch(batch_id).cloned()
    }

    async fn snapshot(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        let inner = self.inner.read();
        let batch = inner.batch(batch_id)?;
        Ok(inner.snapshot_of(batch))
    }

    async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<BatchSnapshot>> {
        let inner = self.inner.read();
        let mut batches: Vec<&Batch> = inner
            .batches
            .values()
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            batches.truncate(limit);
        }
        Ok(batches.iter().map(|b| inner.snapshot_of(b)).collect())
    }

    async fn batch_items(&self, batch_id: BatchId) -> Result<Vec<AnyItem>> {
        let inner = self.inner.read();
        inner.batch(batch_id)?;
        let ids = inner.batch_items.get(&batch_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect())
    }

    async fn claim_next_queued_item(
        &self,
        batch_id: BatchId,
        lease_ttl: Duration,
    ) -> Result<Option<Item<InFlight>>> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let batch = inner.batch(batch_id)?;
        if batch.is_terminal() {
            return Err(VolleyError::invalid_batch_state(
                batch_id,
                batch.status.as_str(),
                "pending or running",
            ));
        }
        let limit = batch.concurrency_limit as u64;
        if inner.in_flight_count(batch_id) >= limit {
            return Ok(None);
        }

        // First eligible queued item in insertion order.
        let ids = inner.batch_items.get(&batch_id).cloned().unwrap_or_default();
        let eligible = ids.into_iter().find(|id| match inner.items.get(id) {
            Some(AnyItem::Queued(item)) => item.is_eligible(now),
            _ => false,
        });

        let Some(item_id) = eligible else {
            return Ok(None);
        };

        let Some(AnyItem::Queued(queued)) = inner.items.remove(&item_id) else {
            unreachable!("item state checked above");
        };
        let claimed = queued.claim(now, lease_ttl);
        inner.items.insert(item_id, claimed.clone().into());

        let batch = inner.batches.get_mut(&batch_id).expect("batch exists");
        if batch.status == BatchState::Pending {
            batch.status = BatchState::Running;
        }
        batch.updated_at = now;

        Ok(Some(claimed))
    }

    async fn record_outcome(&self, item_id: ItemId, outcome: ItemOutcome) -> Result<Batch> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let in_flight = match inner.items.get(&item_id) {
            None => return Err(VolleyError::ItemNotFound(item_id)),
            Some(AnyItem::InFlight(item)) => item.clone(),
            Some(other) => {
                return Err(VolleyError::invalid_item_state(
                    item_id,
                    other.variant(),
                    "in_flight",
                ))
            }
        };

        let batch_id = in_flight.data.batch_id;
        let batch = inner.batch(batch_id)?;
        // A cancelled batch still drains in-flight outcomes; any other
        // terminal status means the accounting already closed.
        if batch.is_terminal() && batch.status != BatchState::Cancelled {
            return Err(VolleyError::invalid_batch_state(
                batch_id,
                batch.status.as_str(),
                "running or cancelled",
            ));
        }

        let settled: AnyItem = match outcome {
            ItemOutcome::Success(response) => in_flight.succeed(response, now).into(),
            ItemOutcome::Failure(reason) => in_flight.fail(reason, now).into(),
        };
        let succeeded = matches!(settled, AnyItem::Succeeded(_));
        inner.items.insert(item_id, settled);

        let batch = inner.batches.get_mut(&batch_id).expect("batch exists");
        if succeeded {
            batch.completed_items += 1;
        } else {
            batch.failed_items += 1;
        }
        debug_assert!(batch.settled_items() <= batch.total_items);
        batch.updated_at = now;
        batch.settle_if_finished(now);

        Ok(batch.clone())
    }

    async fn cancel_batch(&self, batch_id: BatchId) -> Result<Batch> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let batch = inner.batch(batch_id)?;
        if batch.is_terminal() {
            return Err(VolleyError::invalid_batch_state(
                batch_id,
                batch.status.as_str(),
                "pending or running",
            ));
        }

        // Flip every queued item to cancelled; in-flight items drain.
        let ids = inner.batch_items.get(&batch_id).cloned().unwrap_or_default();
        let mut cancelled = 0u64;
        for id in ids {
            if let Some(AnyItem::Queued(_)) = inner.items.get(&id) {
                let Some(AnyItem::Queued(item)) = inner.items.remove(&id) else {
                    unreachable!("item state checked above");
                };
                inner.items.insert(id, item.cancel(now).into());
                cancelled += 1;
            }
        }

        let batch = inner.batches.get_mut(&batch_id).expect("batch exists");
        batch.cancelled_items += cancelled;
        batch.status = BatchState::Cancelled;
        batch.cancelled_at = Some(now);
        batch.updated_at = now;

        Ok(batch.clone())
    }

    async fn fail_batch(&self, batch_id: BatchId, error: String) -> Result<Batch> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let batch = inner.batch(batch_id)?;
        if batch.is_terminal() {
            return Err(VolleyError::invalid_batch_state(
                batch_id,
                batch.status.as_str(),
                "pending or running",
            ));
        }

        let ids = inner.batch_items.get(&batch_id).cloned().unwrap_or_default();
        let mut cancelled = 0u64;
        for id in ids {
            if let Some(AnyItem::Queued(_)) = inner.items.get(&id) {
                let Some(AnyItem::Queued(item)) = inner.items.remove(&id) else {
                    unreachable!("item state checked above");
                };
                inner.items.insert(id, item.cancel(now).into());
                cancelled += 1;
            }
        }

        let batch = inner.batches.get_mut(&batch_id).expect("batch exists");
        batch.cancelled_items += cancelled;
        batch.status = BatchState::Failed;
        batch.failed_at = Some(now);
        batch.error = Some(error);
        batch.updated_at = now;

        Ok(batch.clone())
    }

    async fn active_batches(&self) -> Result<Vec<BatchId>> {
        let inner = self.inner.read();
        let mut active: Vec<&Batch> = inner
            .batches
            .values()
            .filter(|b| !b.is_terminal() && inner.queued_count(b.id) > 0)
            .collect();
        active.sort_by_key(|b| b.created_at);
        Ok(active.iter().map(|b| b.id).collect())
    }

    async fn renew_leases(&self, item_ids: &[ItemId], lease_ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        for id in item_ids {
            if let Some(AnyItem::InFlight(_)) = inner.items.get(id) {
                let Some(AnyItem::InFlight(item)) = inner.items.remove(id) else {
                    unreachable!("item state checked above");
                };
                inner
                    .items
                    .insert(*id, item.renew_lease(now, lease_ttl).into());
            }
        }
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        max_attempts: u32,
        requeue_delay: Duration,
    ) -> Result<Vec<ReclaimedItem>> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let stale: Vec<ItemId> = inner
            .items
            .iter()
            .filter_map(|(id, item)| match item {
                AnyItem::InFlight(i) if i.lease_expired(now) => Some(*id),
                _ => None,
            })
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for item_id in stale {
            let Some(AnyItem::InFlight(item)) = inner.items.remove(&item_id) else {
                continue;
            };
            let batch_id = item.data.batch_id;
            let batch_terminal = inner
                .batches
                .get(&batch_id)
                .map(|b| b.is_terminal())
                .unwrap_or(false);

            if batch_terminal {
                // The batch already settled (cancelled or failed); requeueing
                // here would strand the item, since terminal batches reject
                // claims. Orphaned work settles as cancelled instead.
                inner.items.insert(item_id, item.cancel(now).into());
                if let Some(batch) = inner.batches.get_mut(&batch_id) {
                    batch.cancelled_items += 1;
                    batch.updated_at = now;
                }
                reclaimed.push(ReclaimedItem {
                    item_id,
                    batch_id,
                    requeued: false,
                });
            } else if item.state.attempt_count >= max_attempts {
                let attempts = item.state.attempt_count;
                inner.items.insert(
                    item_id,
                    item.fail(FailureReason::LeaseExpired { attempts }, now).into(),
                );
                if let Some(batch) = inner.batches.get_mut(&batch_id) {
                    batch.failed_items += 1;
                    batch.updated_at = now;
                    batch.settle_if_finished(now);
                }
                reclaimed.push(ReclaimedItem {
                    item_id,
                    batch_id,
                    requeued: false,
                });
            } else {
                let not_before = if requeue_delay.is_zero() {
                    None
                } else {
                    Some(now + ChronoDuration::from_std(requeue_delay).unwrap_or_default())
                };
                inner.items.insert(item_id, item.release(not_before).into());
                if let Some(batch) = inner.batches.get_mut(&batch_id) {
                    batch.updated_at = now;
                }
                reclaimed.push(ReclaimedItem {
                    item_id,
                    batch_id,
                    requeued: true,
                });
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BackendResponse;

    fn payloads(n: usize) -> Vec<String> {
        (0..n).map(|i| format!(r#"{{"prompt":"p{i}"}}"#)).collect()
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_create_batch_persists_everything_queued() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(3), 2).await.unwrap();
        assert_eq!(batch.status, BatchState::Pending);
        assert_eq!(batch.total_items, 3);

        let items = store.batch_items(batch.id).await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.is_queued()));

        let snapshot = store.snapshot(batch.id).await.unwrap();
        assert_eq!(snapshot.queued_items, 3);
        assert_eq!(snapshot.in_flight_items, 0);
    }

    #[tokio::test]
    async fn test_claim_enforces_per_batch_ceiling() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(5), 2).await.unwrap();

        let a = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        let b = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());

        // Ceiling of 2 reached, third claim yields nothing
        let c = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        assert!(c.is_none());

        // Settling one item frees a slot
        store
            .record_outcome(
                a.unwrap().data.id,
                ItemOutcome::Success(BackendResponse {
                    status: 200,
                    body: "ok".into(),
                }),
            )
            .await
            .unwrap();
        let d = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        assert!(d.is_some());
    }

    #[tokio::test]
    async fn test_first_claim_moves_batch_to_running() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(2), 4).await.unwrap();
        assert_eq!(batch.status, BatchState::Pending);

        store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        let batch = store.get_batch(batch.id).await.unwrap();
        assert_eq!(batch.status, BatchState::Running);
    }

    #[tokio::test]
    async fn test_record_outcome_settles_batch() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(2), 4).await.unwrap();

        let a = store
            .claim_next_queued_item(batch.id, TTL)
            .await
            .unwrap()
            .unwrap();
        let b = store
            .claim_next_queued_item(batch.id, TTL)
            .await
            .unwrap()
            .unwrap();

        let updated = store
            .record_outcome(
                a.data.id,
                ItemOutcome::Success(BackendResponse {
                    status: 200,
                    body: "ok".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, BatchState::Running);
        assert_eq!(updated.completed_items, 1);

        let updated = store
            .record_outcome(
                b.data.id,
                ItemOutcome::Failure(FailureReason::TerminalStatus {
                    status: 400,
                    body: "bad".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, BatchState::CompletedWithErrors);
        assert_eq!(updated.completed_items, 1);
        assert_eq!(updated.failed_items, 1);
        assert!(updated.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_record_outcome_requires_in_flight() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();
        let items = store.batch_items(batch.id).await.unwrap();

        let err = store
            .record_outcome(
                items[0].id(),
                ItemOutcome::Success(BackendResponse {
                    status: 200,
                    body: "ok".into(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_flips_queued_and_is_idempotent_error() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(4), 4).await.unwrap();
        let claimed = store
            .claim_next_queued_item(batch.id, TTL)
            .await
            .unwrap()
            .unwrap();

        let cancelled = store.cancel_batch(batch.id).await.unwrap();
        assert_eq!(cancelled.status, BatchState::Cancelled);
        assert_eq!(cancelled.cancelled_items, 3);

        // Second cancel is an InvalidState no-op
        let err = store.cancel_batch(batch.id).await.unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState { .. }));

        // The in-flight item drains: its outcome is recorded, the batch
        // stays cancelled
        let updated = store
            .record_outcome(
                claimed.data.id,
                ItemOutcome::Success(BackendResponse {
                    status: 200,
                    body: "ok".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, BatchState::Cancelled);
        assert_eq!(updated.completed_items, 1);
        assert_eq!(updated.settled_items(), 4);
    }

    #[tokio::test]
    async fn test_fail_batch_records_error_and_cancels_queued() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(3), 4).await.unwrap();
        store.claim_next_queued_item(batch.id, TTL).await.unwrap();

        let failed = store
            .fail_batch(batch.id, "backend unreachable".to_string())
            .await
            .unwrap();
        assert_eq!(failed.status, BatchState::Failed);
        assert_eq!(failed.cancelled_items, 2);
        assert_eq!(failed.error.as_deref(), Some("backend unreachable"));
        assert!(failed.failed_at.is_some());

        let err = store.fail_batch(batch.id, "again".to_string()).await.unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_claim_on_terminal_batch_rejected() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(2), 2).await.unwrap();
        store.cancel_batch(batch.id).await.unwrap();

        let err = store
            .claim_next_queued_item(batch.id, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let store = MemoryStore::new();
        let missing_batch = BatchId::from(Uuid::new_v4());
        assert!(matches!(
            store.get_batch(missing_batch).await.unwrap_err(),
            VolleyError::BatchNotFound(_)
        ));
        assert!(matches!(
            store
                .record_outcome(
                    ItemId::from(Uuid::new_v4()),
                    ItemOutcome::Failure(FailureReason::LeaseExpired { attempts: 1 })
                )
                .await
                .unwrap_err(),
            VolleyError::ItemNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_reclaim_requeues_stale_lease() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();
        let claimed = store
            .claim_next_queued_item(batch.id, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reclaimed = store.reclaim_expired(5, Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(reclaimed[0].requeued);
        assert_eq!(reclaimed[0].item_id, claimed.data.id);

        let items = store.batch_items(batch.id).await.unwrap();
        assert!(items[0].is_queued());
    }

    #[tokio::test]
    async fn test_reclaim_settles_stale_item_of_failed_batch() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(2), 2).await.unwrap();
        store
            .claim_next_queued_item(batch.id, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        store
            .fail_batch(batch.id, "backend unreachable".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reclaimed = store.reclaim_expired(5, Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(!reclaimed[0].requeued);

        // The orphan settles as cancelled; requeueing it would strand it,
        // since a failed batch never accepts another claim
        let batch = store.get_batch(batch.id).await.unwrap();
        assert_eq!(batch.status, BatchState::Failed);
        assert_eq!(batch.cancelled_items, 2);
        assert_eq!(batch.settled_items(), batch.total_items);
        let items = store.batch_items(batch.id).await.unwrap();
        assert!(items.iter().all(|i| i.is_terminal()));
    }

    #[tokio::test]
    async fn test_reclaim_requeues_behind_backoff_gate() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();
        store
            .claim_next_queued_item(batch.id, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reclaimed = store
            .reclaim_expired(5, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(reclaimed[0].requeued);

        // Requeued but gated: the next claim defers until the backoff lapses
        let items = store.batch_items(batch.id).await.unwrap();
        assert!(items[0].is_queued());
        let claimed = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_reclaim_fails_permanently_at_attempt_cap() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();

        // Claim with attempt_count reaching the cap of 1
        store
            .claim_next_queued_item(batch.id, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reclaimed = store.reclaim_expired(1, Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(!reclaimed[0].requeued);

        let batch = store.get_batch(batch.id).await.unwrap();
        assert_eq!(batch.status, BatchState::CompletedWithErrors);
        assert_eq!(batch.failed_items, 1);
    }

    #[tokio::test]
    async fn test_renewed_lease_survives_reclaim() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();
        let claimed = store
            .claim_next_queued_item(batch.id, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .renew_leases(&[claimed.data.id], Duration::from_secs(60))
            .await
            .unwrap();

        let reclaimed = store.reclaim_expired(5, Duration::ZERO).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_active_batches_tracks_dispatchable_work() {
        let store = MemoryStore::new();
        let a = store.create_batch(payloads(1), 1).await.unwrap();
        let b = store.create_batch(payloads(1), 1).await.unwrap();

        let active = store.active_batches().await.unwrap();
        assert_eq!(active, vec![a.id, b.id]);

        // Claiming batch a's only item removes it from the active set
        store.claim_next_queued_item(a.id, TTL).await.unwrap();
        let active = store.active_batches().await.unwrap();
        assert_eq!(active, vec![b.id]);
    }

    #[tokio::test]
    async fn test_list_batches_filters_and_limits() {
        let store = MemoryStore::new();
        let a = store.create_batch(payloads(1), 1).await.unwrap();
        store.create_batch(payloads(1), 1).await.unwrap();
        store.cancel_batch(a.id).await.unwrap();

        let cancelled = store
            .list_batches(BatchFilter {
                status: Some(BatchState::Cancelled),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].batch_id, a.id);

        let limited = store
            .list_batches(BatchFilter {
                status: None,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_gate_defers_claim() {
        let store = MemoryStore::new();
        let batch = store.create_batch(payloads(1), 1).await.unwrap();

        // Push the item behind a future backoff gate by hand
        {
            let mut inner = store.inner.write();
            let ids = inner.batch_items.get(&batch.id).unwrap().clone();
            let Some(AnyItem::Queued(mut item)) = inner.items.remove(&ids[0]) else {
                panic!("expected queued item");
            };
            item.state.not_before = Some(Utc::now() + chrono::Duration::seconds(60));
            inner.items.insert(ids[0], item.into());
        }

        let claimed = store.claim_next_queued_item(batch.id, TTL).await.unwrap();
        assert!(claimed.is_none());
    }
}
