//! Batch admission: validation and durable intake.
//!
//! Admission is all-or-nothing. Every payload is validated before anything
//! touches the store, so a rejected submission leaves no partial batch
//! behind, and an accepted batch is fully persisted before its ID is
//! returned to the caller.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::Notify;
use tracing::info;

use crate::domain::batch::BatchId;
use crate::error::{Result, VolleyError};
use crate::store::RequestStore;

/// Validates and persists incoming batches.
pub struct AdmissionController<S> {
    store: Arc<S>,
    default_concurrency_limit: usize,
    wake: Arc<Notify>,
}

impl<S: RequestStore> AdmissionController<S> {
    pub fn new(store: Arc<S>, default_concurrency_limit: usize, wake: Arc<Notify>) -> Self {
        Self {
            store,
            default_concurrency_limit,
            wake,
        }
    }

    /// Admit a batch of inference request payloads.
    ///
    /// Each payload must be a JSON object. `concurrency_limit` overrides the
    /// engine default for this batch; zero is rejected.
    ///
    /// On success the batch and all its items are durably queued and the
    /// scheduler has been nudged. The returned ID is immediately valid for
    /// status queries and cancellation.
    #[tracing::instrument(skip(self, payloads), fields(item_count = payloads.len()))]
    pub async fn submit_batch(
        &self,
        payloads: Vec<String>,
        concurrency_limit: Option<usize>,
    ) -> Result<BatchId> {
        if payloads.is_empty() {
            return Err(VolleyError::Validation(
                "batch must contain at least one request".to_string(),
            ));
        }
        let limit = concurrency_limit.unwrap_or(self.default_concurrency_limit);
        if limit == 0 {
            return Err(VolleyError::Validation(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }

        for (index, payload) in payloads.iter().enumerate() {
            validate_payload(index, payload)?;
        }

        let batch = self.store.create_batch(payloads, limit).await?;
        counter!("volley_batches_submitted_total").increment(1);
        counter!("volley_items_submitted_total").increment(batch.total_items);
        info!(
            batch_id = %batch.id,
            total_items = batch.total_items,
            concurrency_limit = limit,
            "batch admitted"
        );

        self.wake.notify_one();
        Ok(batch.id)
    }
}

/// Check that a payload is a JSON object suitable for the backend.
fn validate_payload(index: usize, payload: &str) -> Result<()> {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(other) => Err(VolleyError::Validation(format!(
            "request {index} must be a JSON object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(VolleyError::Validation(format!(
            "request {index} is not valid JSON: {e}"
        ))),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
