//! State transitions for items.
//!
//! Transitions return a differently-typed item, so only valid moves compile:
//!
//! ```text
//! Item<Queued> ──claim()──> Item<InFlight> ──succeed()──> Item<Succeeded>
//!       │                        │          ──fail()─────> Item<Failed>
//!       │                        │          ──cancel()───> Item<Cancelled>
//!       │                        └──release()──> Item<Queued>   (lease reclaim)
//!       └──cancel()──> Item<Cancelled>
//! ```
//!
//! Transitions are pure: persistence is the store's job, and the store
//! applies these inside its own transaction boundary.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use super::state::{
    Cancelled, Failed, FailureReason, InFlight, Item, Queued, Succeeded,
};
use crate::client::BackendResponse;

impl Item<Queued> {
    /// Check whether this item's backoff gate allows claiming at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state.not_before {
            Some(not_before) => not_before <= now,
            None => true,
        }
    }

    /// Claim this item for dispatch, stamping a lease.
    ///
    /// The attempt counter is bumped here: a claim is a dispatch attempt,
    /// whether or not the worker survives to record an outcome.
    pub fn claim(self, now: DateTime<Utc>, lease_ttl: Duration) -> Item<InFlight> {
        Item {
            state: InFlight {
                claimed_at: now,
                lease_expires_at: now + ChronoDuration::from_std(lease_ttl).unwrap_or_default(),
                attempt_count: self.state.attempt_count + 1,
            },
            data: self.data,
        }
    }

    pub fn cancel(self, now: DateTime<Utc>) -> Item<Cancelled> {
        Item {
            state: Cancelled { cancelled_at: now },
            data: self.data,
        }
    }
}

impl Item<InFlight> {
    /// Check whether the lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.lease_expires_at < now
    }

    /// Extend the lease. Called by the scheduler's heartbeat while the
    /// owning worker is still alive.
    pub fn renew_lease(self, now: DateTime<Utc>, lease_ttl: Duration) -> Item<InFlight> {
        Item {
            state: InFlight {
                lease_expires_at: now + ChronoDuration::from_std(lease_ttl).unwrap_or_default(),
                ..self.state
            },
            data: self.data,
        }
    }

    pub fn succeed(self, response: BackendResponse, now: DateTime<Utc>) -> Item<Succeeded> {
        Item {
            state: Succeeded {
                response_status: response.status,
                response_body: response.body,
                claimed_at: self.state.claimed_at,
                completed_at: now,
                attempt_count: self.state.attempt_count,
            },
            data: self.data,
        }
    }

    pub fn fail(self, reason: FailureReason, now: DateTime<Utc>) -> Item<Failed> {
        Item {
            state: Failed {
                reason,
                failed_at: now,
                attempt_count: self.state.attempt_count,
            },
            data: self.data,
        }
    }

    pub fn cancel(self, now: DateTime<Utc>) -> Item<Cancelled> {
        Item {
            state: Cancelled { cancelled_at: now },
            data: self.data,
        }
    }

    /// Return this item to the queue after its lease expired.
    ///
    /// The attempt counter is preserved; the next claim bumps it. The
    /// `not_before` gate defers redispatch so a reclaimed item does not hit
    /// the backend again the instant it is swept.
    pub fn release(self, not_before: Option<DateTime<Utc>>) -> Item<Queued> {
        Item {
            state: Queued {
                attempt_count: self.state.attempt_count,
                not_before,
            },
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::BatchId;
    use crate::domain::item::{ItemData, ItemId};
    use uuid::Uuid;

    fn queued_item() -> Item<Queued> {
        Item {
            state: Queued {
                attempt_count: 0,
                not_before: None,
            },
            data: ItemData {
                id: ItemId::from(Uuid::new_v4()),
                batch_id: BatchId::from(Uuid::new_v4()),
                payload: r#"{"prompt":"hi"}"#.to_string(),
            },
        }
    }

    #[test]
    fn test_claim_bumps_attempt_and_stamps_lease() {
        let now = Utc::now();
        let in_flight = queued_item().claim(now, Duration::from_secs(30));
        assert_eq!(in_flight.state.attempt_count, 1);
        assert_eq!(in_flight.state.claimed_at, now);
        assert!(in_flight.state.lease_expires_at > now);
        assert!(!in_flight.lease_expired(now));
    }

    #[test]
    fn test_backoff_gate_blocks_until_not_before() {
        let now = Utc::now();
        let mut item = queued_item();
        item.state.not_before = Some(now + ChronoDuration::seconds(10));
        assert!(!item.is_eligible(now));
        assert!(item.is_eligible(now + ChronoDuration::seconds(11)));
    }

    #[test]
    fn test_release_preserves_attempt_count() {
        let now = Utc::now();
        let in_flight = queued_item().claim(now, Duration::from_millis(1));
        let requeued = in_flight.release(None);
        assert_eq!(requeued.state.attempt_count, 1);
        assert!(requeued.state.not_before.is_none());
    }

    #[test]
    fn test_release_with_backoff_gates_eligibility() {
        let now = Utc::now();
        let in_flight = queued_item().claim(now, Duration::from_millis(1));
        let requeued = in_flight.release(Some(now + ChronoDuration::seconds(5)));
        assert_eq!(requeued.state.attempt_count, 1);
        assert!(!requeued.is_eligible(now));
        assert!(requeued.is_eligible(now + ChronoDuration::seconds(6)));
    }

    #[test]
    fn test_succeed_keeps_response_byte_exact() {
        let now = Utc::now();
        let in_flight = queued_item().claim(now, Duration::from_secs(30));
        let response = BackendResponse {
            status: 200,
            body: r#"{"choices":[{"text":"out"}]}"#.to_string(),
        };
        let done = in_flight.succeed(response.clone(), now);
        assert_eq!(done.state.response_status, response.status);
        assert_eq!(done.state.response_body, response.body);
        assert_eq!(done.state.attempt_count, 1);
    }

    #[test]
    fn test_lease_expiry_detection() {
        let now = Utc::now();
        let in_flight = queued_item().claim(now, Duration::from_millis(5));
        assert!(in_flight.lease_expired(now + ChronoDuration::seconds(1)));
        let renewed = in_flight.renew_lease(now + ChronoDuration::seconds(1), Duration::from_secs(30));
        assert!(!renewed.lease_expired(now + ChronoDuration::seconds(1)));
    }
}
