//! Item lifecycle states.
//!
//! Each item progresses through distinct states, enforced at compile time
//! via the typestate pattern. The store holds items as [`AnyItem`] and the
//! scheduler works with the typed forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::BackendResponse;
use crate::domain::batch::BatchId;

/// Unique identifier for an item in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl From<Uuid> for ItemId {
    fn from(uuid: Uuid) -> Self {
        ItemId(uuid)
    }
}

impl std::ops::Deref for ItemId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Marker trait for valid item states.
pub trait ItemState: Send + Sync {}

/// An inference request item in the volley system.
///
/// The generic parameter `T` represents the current state of the item.
#[derive(Debug, Clone, Serialize)]
pub struct Item<T: ItemState> {
    /// The current state of the item.
    pub state: T,
    /// The immutable request data.
    pub data: ItemData,
}

/// Immutable data for an item.
///
/// The payload is the inference request body exactly as submitted; it never
/// changes after admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemData {
    pub id: ItemId,
    /// Back-reference to the owning batch. Items are never addressable
    /// outside their batch context.
    pub batch_id: BatchId,
    /// The inference request body as a JSON string.
    pub payload: String,
}

// ============================================================================
// Item States
// ============================================================================

/// Item is waiting to be dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct Queued {
    /// Number of times this item has been dispatched (0 = never).
    pub attempt_count: u32,
    /// Earliest time this item can be claimed. `None` means immediately.
    pub not_before: Option<DateTime<Utc>>,
}

impl ItemState for Queued {}

/// Item has been claimed and its backend call is in flight.
///
/// The lease expiry is the crash-recovery heartbeat: an in-flight item whose
/// lease has lapsed with no renewal is presumed orphaned and reclaimed.
#[derive(Debug, Clone, Serialize)]
pub struct InFlight {
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl ItemState for InFlight {}

/// Item completed successfully.
#[derive(Debug, Clone, Serialize)]
pub struct Succeeded {
    /// HTTP status returned by the backend.
    pub response_status: u16,
    /// Response body, byte-exact as the backend returned it.
    pub response_body: String,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl ItemState for Succeeded {}

/// Reason why an item failed permanently.
///
/// Retryable backend errors are retried inside the backend client; by the
/// time a failure reaches the store it is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The backend returned a client error that will never succeed on retry
    /// (e.g. 400 for a malformed payload).
    TerminalStatus { status: u16, body: String },

    /// Retryable errors (timeouts, 5xx, connection resets) exhausted the
    /// retry budget.
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_error: String,
    },

    /// The item's lease expired repeatedly and the reclaim cap was hit,
    /// so it was permanently failed to stop an infinite reclaim loop.
    LeaseExpired { attempts: u32 },
}

impl FailureReason {
    /// Returns a human-readable error message for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::TerminalStatus { status, body } => {
                format!("Backend returned terminal status {status}: {body}")
            }
            FailureReason::RetriesExhausted {
                attempts,
                last_status,
                last_error,
            } => match last_status {
                Some(status) => format!(
                    "Retry budget exhausted after {attempts} attempts, last status {status}: {last_error}"
                ),
                None => format!(
                    "Retry budget exhausted after {attempts} attempts: {last_error}"
                ),
            },
            FailureReason::LeaseExpired { attempts } => {
                format!("Lease expired after {attempts} dispatch attempts, reclaim cap reached")
            }
        }
    }
}

/// Item failed permanently.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl ItemState for Failed {}

/// Item was cancelled before dispatch (batch cancellation cascade).
#[derive(Debug, Clone, Serialize)]
pub struct Cancelled {
    pub cancelled_at: DateTime<Utc>,
}

impl ItemState for Cancelled {}

// ============================================================================
// Outcomes
// ============================================================================

/// Outcome of executing one item, as reported by a worker.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// The backend call succeeded; carries the exact backend response.
    Success(BackendResponse),
    /// The backend call failed permanently.
    Failure(FailureReason),
}

// ============================================================================
// Unified Item Representation
// ============================================================================

/// Enum that can hold an item in any state.
///
/// This is used for storage and queries where items are handled uniformly
/// regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "item")]
pub enum AnyItem {
    Queued(Item<Queued>),
    InFlight(Item<InFlight>),
    Succeeded(Item<Succeeded>),
    Failed(Item<Failed>),
    Cancelled(Item<Cancelled>),
}

impl AnyItem {
    /// Get the item ID regardless of state.
    pub fn id(&self) -> ItemId {
        self.data().id
    }

    /// Get the owning batch ID regardless of state.
    pub fn batch_id(&self) -> BatchId {
        self.data().batch_id
    }

    /// Get the variant name of the current state.
    pub fn variant(&self) -> &'static str {
        match self {
            AnyItem::Queued(_) => "queued",
            AnyItem::InFlight(_) => "in_flight",
            AnyItem::Succeeded(_) => "succeeded",
            AnyItem::Failed(_) => "failed",
            AnyItem::Cancelled(_) => "cancelled",
        }
    }

    /// Get the item data regardless of state.
    pub fn data(&self) -> &ItemData {
        match self {
            AnyItem::Queued(i) => &i.data,
            AnyItem::InFlight(i) => &i.data,
            AnyItem::Succeeded(i) => &i.data,
            AnyItem::Failed(i) => &i.data,
            AnyItem::Cancelled(i) => &i.data,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, AnyItem::Queued(_))
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, AnyItem::InFlight(_))
    }

    /// Check if this item is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnyItem::Succeeded(_) | AnyItem::Failed(_) | AnyItem::Cancelled(_)
        )
    }
}

impl From<Item<Queued>> for AnyItem {
    fn from(i: Item<Queued>) -> Self {
        AnyItem::Queued(i)
    }
}

impl From<Item<InFlight>> for AnyItem {
    fn from(i: Item<InFlight>) -> Self {
        AnyItem::InFlight(i)
    }
}

impl From<Item<Succeeded>> for AnyItem {
    fn from(i: Item<Succeeded>) -> Self {
        AnyItem::Succeeded(i)
    }
}

impl From<Item<Failed>> for AnyItem {
    fn from(i: Item<Failed>) -> Self {
        AnyItem::Failed(i)
    }
}

impl From<Item<Cancelled>> for AnyItem {
    fn from(i: Item<Cancelled>) -> Self {
        AnyItem::Cancelled(i)
    }
}
