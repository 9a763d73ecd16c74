//! Error types for the dispatch engine.

use thiserror::Error;

use crate::domain::batch::BatchId;
use crate::domain::item::ItemId;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the dispatch engine.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Item not found
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    /// Batch submission rejected before anything was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation attempted against a batch or item in the wrong state
    #[error("Invalid state: {entity} is in state '{actual}', expected '{expected}'")]
    InvalidState {
        entity: String,
        actual: String,
        expected: String,
    },

    /// The durability layer is unreachable. Escalated, never swallowed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Build an `InvalidState` error for a batch.
    pub fn invalid_batch_state(id: BatchId, actual: &str, expected: &str) -> Self {
        VolleyError::InvalidState {
            entity: format!("batch {id}"),
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Build an `InvalidState` error for an item.
    pub fn invalid_item_state(id: ItemId, actual: &str, expected: &str) -> Self {
        VolleyError::InvalidState {
            entity: format!("item {id}"),
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }
}
