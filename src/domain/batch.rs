//! Batch types for grouping and tracking inference requests.
//!
//! A batch is a client-submitted group of independent inference requests
//! tracked and reported as one unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Aggregate state of a batch.
///
/// `Pending` and `Running` are transient; the other four are terminal.
/// Transitions only move forward, except cancellation which is terminal
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Persisted, no item claimed yet.
    Pending,
    /// At least one item has been claimed.
    Running,
    /// All items settled, none failed.
    Completed,
    /// All items settled, at least one failed.
    CompletedWithErrors,
    /// Unrecoverable store or backend error while processing.
    Failed,
    /// Cancel requested before the batch settled.
    Cancelled,
}

impl BatchState {
    /// Check if this state is terminal. No transition leaves the terminal set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed
                | BatchState::CompletedWithErrors
                | BatchState::Failed
                | BatchState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::CompletedWithErrors => "completed_with_errors",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch record as held by the request store.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchState,

    /// Counter fields. Monotonically non-decreasing; their sum never
    /// exceeds `total_items`.
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub cancelled_items: u64,

    /// Effective per-batch in-flight ceiling.
    pub concurrency_limit: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Terminal state timestamps (set once when the batch enters that state)
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Batch-level error message (only set when status is `Failed`)
    pub error: Option<String>,
}

impl Batch {
    /// Create a fresh pending batch.
    pub fn new(total_items: u64, concurrency_limit: usize) -> Self {
        let now = Utc::now();
        Batch {
            id: BatchId::from(Uuid::new_v4()),
            status: BatchState::Pending,
            total_items,
            completed_items: 0,
            failed_items: 0,
            cancelled_items: 0,
            concurrency_limit,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            error: None,
        }
    }

    /// Number of items that have reached a terminal state.
    pub fn settled_items(&self) -> u64 {
        self.completed_items + self.failed_items + self.cancelled_items
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Derive the terminal status once every item has settled.
    ///
    /// A cancelled batch keeps its `Cancelled` status regardless of the
    /// outcomes of items that were still in flight when cancellation
    /// happened.
    pub fn settle_if_finished(&mut self, now: DateTime<Utc>) {
        if self.status == BatchState::Cancelled || self.settled_items() < self.total_items {
            return;
        }
        if self.failed_items > 0 {
            self.status = BatchState::CompletedWithErrors;
        } else {
            self.status = BatchState::Completed;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Point-in-time view of a batch, returned by status queries.
///
/// Snapshots never block on in-flight work; they are read straight off the
/// store's counters.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub status: BatchState,
    pub total_items: u64,
    pub queued_items: u64,
    pub in_flight_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub cancelled_items: u64,
    pub concurrency_limit: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchSnapshot {
    /// Check if every item has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.completed_items + self.failed_items + self.cancelled_items == self.total_items
    }
}

/// Filter for listing batches.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    /// Only return batches in this state.
    pub status: Option<BatchState>,
    /// Maximum number of snapshots to return (newest first).
    pub limit: Option<usize>,
}
