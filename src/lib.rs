//! # Volley
//!
//! A batch admission-and-dispatch engine for LLM inference backends.
//!
//! Callers submit batches of independent inference requests; volley
//! persists them, dispatches them against a fixed-capacity backend under a
//! global worker pool and a per-batch concurrency ceiling, retries
//! retryable backend errors with bounded exponential backoff, and keeps
//! batch accounting exact under concurrent completion, partial failure,
//! cancellation, and crash restart.
//!
//! ## Architecture
//!
//! - [`admission`]: validates submissions and persists them atomically.
//! - [`store`]: the [`store::RequestStore`] trait and the in-memory
//!   implementation; the single source of truth for batch and item state.
//! - [`scheduler`]: the dispatch loop — claims items round-robin across
//!   batches, spawns workers, renews leases, reclaims orphans.
//! - [`pool`]: the global worker pool bounding concurrent backend calls.
//! - [`client`]: the backend abstraction, retry loop, and HTTP/mock
//!   implementations.
//! - [`tracker`]: status queries, result retrieval, and cancellation.
//! - [`engine`]: the [`engine::BatchEngine`] facade tying it together.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use volley::client::HttpBackend;
//! use volley::engine::BatchEngine;
//! use volley::scheduler::EngineConfig;
//! use volley::store::MemoryStore;
//!
//! # async fn example() -> volley::error::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let backend = HttpBackend::new("http://localhost:8000/v1/completions");
//! let engine = BatchEngine::new(store, backend, EngineConfig::from_env());
//!
//! let shutdown = CancellationToken::new();
//! let handle = engine.run(shutdown.clone());
//!
//! let batch_id = engine
//!     .submit_batch(vec![r#"{"prompt":"hello"}"#.to_string()], None)
//!     .await?;
//! let status = engine.get_status(batch_id).await?;
//! println!("batch {batch_id}: {}", status.status);
//!
//! shutdown.cancel();
//! handle.await.expect("scheduler task")?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod client;
pub mod domain;
pub mod engine;
pub mod error;
#[cfg(feature = "metrics-export")]
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod tracker;

pub use client::{BackendClient, BackendResponse, HttpBackend, InferenceBackend, MockBackend};
pub use domain::batch::{Batch, BatchFilter, BatchId, BatchSnapshot, BatchState};
pub use domain::item::{AnyItem, FailureReason, ItemId, ItemOutcome};
pub use engine::BatchEngine;
pub use error::{Result, VolleyError};
pub use scheduler::EngineConfig;
pub use store::{MemoryStore, RequestStore};
