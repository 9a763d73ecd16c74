//! Dispatch scheduler: the long-running loop that moves queued items
//! through the worker pool to the backend and records their outcomes.
//!
//! One scheduler per process. The loop claims items round-robin across
//! active batches so a large early batch cannot starve later ones, spawns
//! one worker task per claimed item, and sleeps until woken by a completed
//! item, a new submission, or the claim interval.
//!
//! Three auxiliary tasks run alongside: a lease-renewal heartbeat for items
//! this process owns, a stale-lease reclaim sweep for items orphaned by a
//! crashed process, and an optional periodic status log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{BackendClient, InferenceBackend, RetryPolicy};
use crate::domain::batch::BatchId;
use crate::domain::item::{InFlight, Item, ItemId, ItemOutcome};
use crate::error::{Result, VolleyError};
use crate::pool::{WorkToken, WorkerPool};
use crate::store::RequestStore;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global worker pool size: the hard ceiling on concurrent backend
    /// calls across all batches.
    pub max_workers: usize,

    /// Default per-batch in-flight ceiling, used when a submission does not
    /// set its own.
    pub max_concurrent_per_batch: usize,

    /// Timeout for a single backend call, in milliseconds.
    pub backend_timeout_ms: u64,

    /// Maximum retries per item for retryable backend errors.
    pub retry_budget: u32,

    /// Base backoff between retries, in milliseconds.
    pub backoff_ms: u64,

    /// Multiplier applied to the backoff after each retry.
    pub backoff_factor: u64,

    /// Backoff ceiling, in milliseconds.
    pub max_backoff_ms: u64,

    /// How long the scheduler sleeps between claim passes when nothing
    /// wakes it sooner.
    pub claim_interval_ms: u64,

    /// Interval for the periodic status log line. `None` disables it.
    pub status_log_interval_ms: Option<u64>,

    /// Lease duration stamped on claimed items.
    pub lease_ttl_ms: u64,

    /// How often the heartbeat extends leases of locally-owned items.
    /// Must be well below `lease_ttl_ms`.
    pub lease_renew_interval_ms: u64,

    /// How often the reclaim sweep looks for expired leases.
    pub reclaim_interval_ms: u64,

    /// Backoff applied to a reclaimed item before it can be claimed again.
    pub reclaim_backoff_ms: u64,

    /// Dispatch attempts after which a repeatedly-reclaimed item is failed
    /// permanently instead of requeued.
    pub max_claim_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            max_concurrent_per_batch: 8,
            backend_timeout_ms: 600_000,
            retry_budget: 5,
            backoff_ms: 1_000,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
            claim_interval_ms: 1_000,
            status_log_interval_ms: Some(2_000),
            lease_ttl_ms: 60_000,
            lease_renew_interval_ms: 10_000,
            reclaim_interval_ms: 5_000,
            reclaim_backoff_ms: 1_000,
            max_claim_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    ///
    /// Recognized variables: `MAX_WORKERS`, `MAX_CONCURRENT_BATCHES`
    /// (per-batch ceiling), `BACKEND_TIMEOUT` (seconds), `RETRY_BUDGET`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("MAX_WORKERS") {
            config.max_workers = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONCURRENT_BATCHES") {
            config.max_concurrent_per_batch = v;
        }
        if let Some(v) = env_parse::<u64>("BACKEND_TIMEOUT") {
            config.backend_timeout_ms = v * 1000;
        }
        if let Some(v) = env_parse::<u32>("RETRY_BUDGET") {
            config.retry_budget = v;
        }
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_budget: self.retry_budget,
            backoff_ms: self.backoff_ms,
            backoff_factor: self.backoff_factor,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn reclaim_backoff(&self) -> Duration {
        Duration::from_millis(self.reclaim_backoff_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// The dispatch loop and its auxiliary tasks.
pub struct DispatchScheduler<S, B: InferenceBackend> {
    store: Arc<S>,
    client: Arc<BackendClient<B>>,
    pool: Arc<WorkerPool>,
    config: EngineConfig,
    wake: Arc<Notify>,
    /// Items claimed by this process whose leases the heartbeat renews.
    owned_items: Arc<DashMap<ItemId, BatchId>>,
    /// Round-robin position across active batches.
    cursor: AtomicUsize,
}

impl<S, B> DispatchScheduler<S, B>
where
    S: RequestStore + 'static,
    B: InferenceBackend + 'static,
{
    pub fn new(
        store: Arc<S>,
        client: Arc<BackendClient<B>>,
        pool: Arc<WorkerPool>,
        config: EngineConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            client,
            pool,
            config,
            wake,
            owned_items: Arc::new(DashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Run the scheduler until `shutdown` is cancelled.
    ///
    /// On shutdown the loop stops claiming, lets in-flight workers record
    /// their outcomes, then returns. Items still queued at that point are
    /// picked up by the next process via the normal claim path; anything a
    /// worker could not finish surfaces through lease reclaim.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            max_workers = self.config.max_workers,
            max_concurrent_per_batch = self.config.max_concurrent_per_batch,
            "Dispatch scheduler starting"
        );

        // Recover anything orphaned by a previous process before dispatching.
        self.run_reclaim_sweep().await;

        let renewal = tokio::spawn(self.clone().lease_renewal_task(shutdown.clone()));
        let reclaim = tokio::spawn(self.clone().reclaim_task(shutdown.clone()));
        let status_log = self
            .config
            .status_log_interval_ms
            .map(|ms| tokio::spawn(self.clone().status_log_task(shutdown.clone(), ms)));

        let mut workers: JoinSet<()> = JoinSet::new();
        let claim_interval = Duration::from_millis(self.config.claim_interval_ms);

        loop {
            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task panicked");
                }
            }

            self.dispatch_available(&mut workers).await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(claim_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(
            in_flight = workers.len(),
            "Shutdown requested, draining in-flight work"
        );
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked during drain");
            }
        }

        renewal.abort();
        reclaim.abort();
        if let Some(handle) = status_log {
            handle.abort();
        }

        info!("Dispatch scheduler stopped");
        Ok(())
    }

    /// One claim pass: fill free worker slots from active batches,
    /// round-robin, one item per batch per sweep.
    async fn dispatch_available(self: &Arc<Self>, workers: &mut JoinSet<()>) {
        loop {
            let active = match self.store.active_batches().await {
                Ok(active) => active,
                Err(e) => {
                    error!(error = %e, "Failed to list active batches");
                    return;
                }
            };
            if active.is_empty() {
                return;
            }

            let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
            let mut claimed_any = false;

            for index in 0..active.len() {
                let batch_id = active[(offset + index) % active.len()];

                let Some(token) = self.pool.try_acquire() else {
                    return;
                };

                match self
                    .store
                    .claim_next_queued_item(batch_id, self.config.lease_ttl())
                    .await
                {
                    Ok(Some(item)) => {
                        claimed_any = true;
                        self.spawn_worker(workers, item, token);
                    }
                    Ok(None) => {
                        // Batch is at its ceiling or its queue drained; the
                        // token is released by drop.
                        drop(token);
                    }
                    Err(VolleyError::InvalidState { .. } | VolleyError::BatchNotFound(_)) => {
                        // Batch settled between listing and claiming.
                        drop(token);
                        debug!(batch_id = %batch_id, "Batch no longer claimable");
                    }
                    Err(e) => {
                        drop(token);
                        error!(batch_id = %batch_id, error = %e, "Claim failed");
                        return;
                    }
                }
            }

            if !claimed_any {
                return;
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        workers: &mut JoinSet<()>,
        item: Item<InFlight>,
        token: WorkToken,
    ) {
        let scheduler = self.clone();
        workers.spawn(async move {
            // The token is released when this task ends, on every path.
            let _token = token;
            scheduler.execute_item(item).await;
        });
    }

    /// Execute one claimed item: call the backend, record the outcome,
    /// nudge the dispatch loop.
    #[tracing::instrument(skip(self, item), fields(item_id = %item.data.id, batch_id = %item.data.batch_id))]
    async fn execute_item(&self, item: Item<InFlight>) {
        let item_id = item.data.id;
        let batch_id = item.data.batch_id;
        self.owned_items.insert(item_id, batch_id);
        let owned = self.owned_items.clone();
        let _unregister = scopeguard::guard((), move |_| {
            owned.remove(&item_id);
        });

        let outcome = match self.client.call(&item.data).await {
            Ok(response) => {
                counter!("volley_items_total", "outcome" => "succeeded").increment(1);
                ItemOutcome::Success(response)
            }
            Err(backend_error) => {
                counter!("volley_items_total", "outcome" => "failed").increment(1);
                warn!(error = %backend_error, "Item failed permanently");
                ItemOutcome::Failure(backend_error.into_failure_reason())
            }
        };

        match self.store.record_outcome(item_id, outcome).await {
            Ok(batch) => {
                if batch.is_terminal() {
                    info!(
                        batch_id = %batch.id,
                        status = %batch.status,
                        completed = batch.completed_items,
                        failed = batch.failed_items,
                        "Batch settled"
                    );
                }
            }
            Err(VolleyError::InvalidState { .. } | VolleyError::ItemNotFound(_)) => {
                // The item was reclaimed or the batch settled elsewhere; the
                // other side's accounting stands.
                debug!("Outcome superseded by a concurrent transition");
            }
            Err(e) => {
                // The outcome is unrecordable; without it the batch can
                // never settle cleanly, so the whole batch fails.
                error!(error = %e, "Failed to record item outcome, failing batch");
                if let Err(fail_err) = self
                    .store
                    .fail_batch(batch_id, format!("could not record item outcome: {e}"))
                    .await
                {
                    warn!(error = %fail_err, "Could not mark batch as failed");
                }
            }
        }

        self.wake.notify_one();
    }

    /// Heartbeat extending the leases of items this process has in flight.
    async fn lease_renewal_task(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.config.lease_renew_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }

            let ids: Vec<ItemId> = self.owned_items.iter().map(|entry| *entry.key()).collect();
            if ids.is_empty() {
                continue;
            }
            if let Err(e) = self.store.renew_leases(&ids, self.config.lease_ttl()).await {
                warn!(error = %e, count = ids.len(), "Lease renewal failed");
            }
        }
    }

    /// Periodic sweep requeueing (or permanently failing) items whose lease
    /// lapsed without renewal.
    async fn reclaim_task(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.config.reclaim_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }
            self.run_reclaim_sweep().await;
        }
    }

    async fn run_reclaim_sweep(&self) {
        match self
            .store
            .reclaim_expired(self.config.max_claim_attempts, self.config.reclaim_backoff())
            .await
        {
            Ok(reclaimed) if reclaimed.is_empty() => {}
            Ok(reclaimed) => {
                let requeued = reclaimed.iter().filter(|r| r.requeued).count();
                counter!("volley_items_reclaimed_total").increment(reclaimed.len() as u64);
                warn!(
                    total = reclaimed.len(),
                    requeued,
                    permanently_failed = reclaimed.len() - requeued,
                    "Reclaimed items with expired leases"
                );
                if requeued > 0 {
                    self.wake.notify_one();
                }
            }
            Err(e) => {
                error!(error = %e, "Lease reclaim sweep failed");
            }
        }
    }

    async fn status_log_task(self: Arc<Self>, shutdown: CancellationToken, interval_ms: u64) {
        let interval = Duration::from_millis(interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }

            let active = match self.store.active_batches().await {
                Ok(active) => active.len(),
                Err(_) => continue,
            };
            info!(
                workers_in_flight = self.pool.in_flight(),
                workers_total = self.pool.capacity(),
                active_batches = active,
                "Scheduler status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 64);
        assert_eq!(config.max_concurrent_per_batch, 8);
        assert_eq!(config.retry_budget, 5);
        assert!(config.lease_renew_interval_ms < config.lease_ttl_ms);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("MAX_WORKERS", "16");
        std::env::set_var("MAX_CONCURRENT_BATCHES", "2");
        std::env::set_var("BACKEND_TIMEOUT", "30");
        std::env::set_var("RETRY_BUDGET", "bogus");

        let config = EngineConfig::from_env();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.max_concurrent_per_batch, 2);
        assert_eq!(config.backend_timeout_ms, 30_000);
        // Unparseable values fall back to the default
        assert_eq!(config.retry_budget, EngineConfig::default().retry_budget);

        std::env::remove_var("MAX_WORKERS");
        std::env::remove_var("MAX_CONCURRENT_BATCHES");
        std::env::remove_var("BACKEND_TIMEOUT");
        std::env::remove_var("RETRY_BUDGET");
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_workers, config.max_workers);
        assert_eq!(parsed.status_log_interval_ms, config.status_log_interval_ms);
    }
}
