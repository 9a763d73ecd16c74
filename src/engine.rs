//! Top-level engine facade wiring admission, tracking, and dispatch
//! together over a shared store and backend.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::client::{BackendClient, InferenceBackend};
use crate::domain::batch::{Batch, BatchFilter, BatchId, BatchSnapshot};
use crate::domain::item::AnyItem;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::scheduler::{DispatchScheduler, EngineConfig};
use crate::store::RequestStore;
use crate::tracker::LifecycleTracker;

/// Batch admission-and-dispatch engine.
///
/// Owns the worker pool and the scheduler; exposes the submission, status,
/// and cancellation surface. Submissions are accepted as soon as the engine
/// is constructed; dispatch begins when [`BatchEngine::run`] is called.
pub struct BatchEngine<S, B: InferenceBackend> {
    admission: AdmissionController<S>,
    tracker: LifecycleTracker<S>,
    scheduler: Arc<DispatchScheduler<S, B>>,
}

impl<S, B> BatchEngine<S, B>
where
    S: RequestStore + 'static,
    B: InferenceBackend + 'static,
{
    pub fn new(store: Arc<S>, backend: B, config: EngineConfig) -> Self {
        let wake = Arc::new(Notify::new());
        let client = Arc::new(BackendClient::new(
            backend,
            config.retry_policy(),
            config.backend_timeout(),
        ));
        let pool = Arc::new(WorkerPool::new(config.max_workers));

        let admission = AdmissionController::new(
            store.clone(),
            config.max_concurrent_per_batch,
            wake.clone(),
        );
        let tracker = LifecycleTracker::new(store.clone());
        let scheduler = Arc::new(DispatchScheduler::new(store, client, pool, config, wake));

        Self {
            admission,
            tracker,
            scheduler,
        }
    }

    /// Start the dispatch loop. Returns the handle of the spawned scheduler
    /// task; it resolves once `shutdown` is cancelled and in-flight work has
    /// drained.
    pub fn run(&self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.scheduler.clone().run(shutdown))
    }

    /// Submit a batch of inference request payloads. See
    /// [`AdmissionController::submit_batch`].
    pub async fn submit_batch(
        &self,
        payloads: Vec<String>,
        concurrency_limit: Option<usize>,
    ) -> Result<BatchId> {
        self.admission.submit_batch(payloads, concurrency_limit).await
    }

    /// Point-in-time status and counts for a batch.
    pub async fn get_status(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        self.tracker.get_status(batch_id).await
    }

    /// All items of a batch with their state and results.
    pub async fn get_results(&self, batch_id: BatchId) -> Result<Vec<AnyItem>> {
        self.tracker.get_results(batch_id).await
    }

    /// List batch snapshots, newest first.
    pub async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<BatchSnapshot>> {
        self.tracker.list_batches(filter).await
    }

    /// Cancel a batch; queued items stop immediately, in-flight items drain.
    pub async fn cancel(&self, batch_id: BatchId) -> Result<Batch> {
        self.tracker.cancel(batch_id).await
    }
}
