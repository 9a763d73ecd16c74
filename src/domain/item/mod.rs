//! Item aggregate - typestate machine and transitions.
//!
//! An item is one inference request within a batch, with its own lifecycle
//! and outcome. The typestate pattern makes invalid transitions
//! unrepresentable: a `Item<Queued>` can only be claimed or cancelled, an
//! `Item<InFlight>` can only settle or be reclaimed.

pub mod state;
pub mod transitions;

pub use state::{
    AnyItem, Cancelled, Failed, FailureReason, InFlight, Item, ItemData, ItemId, ItemOutcome,
    ItemState, Queued, Succeeded,
};
