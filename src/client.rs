//! Backend client abstraction for invoking the downstream inference endpoint.
//!
//! The `InferenceBackend` trait abstracts one raw call to the backend,
//! enabling testability with mock implementations. [`BackendClient`] wraps a
//! backend with error classification and a bounded retry loop: retryable
//! errors (timeouts, 5xx, connection resets) are retried with exponential
//! backoff up to the retry budget; terminal errors (4xx) fail immediately
//! without consuming budget.
//!
//! The backend endpoint is a single logical URL. When a load balancer fronts
//! multiple replicas, its unavailability simply surfaces here as retryable
//! errors that exhaust into a permanent failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::item::{FailureReason, ItemData};
use crate::error::Result;

/// Response from the inference backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

/// Predicate deciding whether an HTTP status should be retried.
pub type ShouldRetryFn = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Default retry predicate: retry on server errors (5xx), rate limits (429),
/// and timeouts (408).
pub fn default_should_retry(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Trait for executing one raw request against the inference backend.
///
/// Transport-level failures (connect errors, timeouts, resets) are returned
/// as `Err`; HTTP error statuses come back as a normal [`BackendResponse`]
/// and are classified by the caller.
#[async_trait]
pub trait InferenceBackend: Send + Sync + Clone {
    /// Execute one inference call with a bounded timeout.
    async fn invoke(&self, item: &ItemData, timeout: Duration) -> Result<BackendResponse>;
}

/// Permanent failure of a backend call, after classification and retries.
#[derive(Debug, Error)]
pub enum BackendError {
    /// 4xx indicating a malformed payload. Never retried.
    #[error("backend returned terminal status {status}")]
    Terminal { status: u16, body: String },

    /// Retryable errors exhausted the retry budget.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_status: Option<u16>,
        last_error: String,
    },
}

impl BackendError {
    /// Convert into the failure reason recorded against the item.
    pub fn into_failure_reason(self) -> FailureReason {
        match self {
            BackendError::Terminal { status, body } => {
                FailureReason::TerminalStatus { status, body }
            }
            BackendError::Exhausted {
                attempts,
                last_status,
                last_error,
            } => FailureReason::RetriesExhausted {
                attempts,
                last_status,
                last_error,
            },
        }
    }
}

/// Retry behavior for retryable backend errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries per item (attempts = retries + 1).
    pub retry_budget: u32,
    /// Base backoff duration in milliseconds.
    pub backoff_ms: u64,
    /// Factor by which the backoff is increased with each retry.
    pub backoff_factor: u64,
    /// Maximum backoff time in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `backoff_ms * (backoff_factor ^ attempt)`,
    /// capped at `max_backoff_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Retrying client over an [`InferenceBackend`].
///
/// Stateless besides the wrapped backend's connection reuse; safe to share
/// across workers behind an `Arc`.
pub struct BackendClient<B: InferenceBackend> {
    backend: B,
    policy: RetryPolicy,
    timeout: Duration,
    should_retry: ShouldRetryFn,
}

impl<B: InferenceBackend> BackendClient<B> {
    pub fn new(backend: B, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            timeout,
            should_retry: Arc::new(default_should_retry),
        }
    }

    /// Replace the retry predicate.
    pub fn with_should_retry(mut self, should_retry: ShouldRetryFn) -> Self {
        self.should_retry = should_retry;
        self
    }

    /// Invoke the backend for one item, retrying retryable errors.
    ///
    /// Emits latency and outcome metrics; emission is fire-and-forget and
    /// never blocks or fails the call.
    #[tracing::instrument(skip(self, item), fields(item_id = %item.id, batch_id = %item.batch_id))]
    pub async fn call(&self, item: &ItemData) -> std::result::Result<BackendResponse, BackendError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let result = self.backend.invoke(item, self.timeout).await;
            attempt += 1;

            let (last_status, last_error) = match result {
                Ok(response) if response.status < 400 => {
                    counter!("volley_backend_calls_total", "outcome" => "success").increment(1);
                    histogram!("volley_backend_call_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(response);
                }
                Ok(response) if (self.should_retry)(response.status) => {
                    counter!(
                        "volley_backend_calls_total",
                        "outcome" => "retryable_status"
                    )
                    .increment(1);
                    tracing::warn!(
                        status = response.status,
                        attempt,
                        "Backend returned retryable status"
                    );
                    (
                        Some(response.status),
                        format!("retryable status {}: {}", response.status, response.body),
                    )
                }
                Ok(response) => {
                    // Terminal client error. Fails immediately, no budget consumed.
                    counter!("volley_backend_calls_total", "outcome" => "terminal").increment(1);
                    histogram!("volley_backend_call_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::warn!(status = response.status, "Backend returned terminal status");
                    return Err(BackendError::Terminal {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(e) => {
                    counter!("volley_backend_calls_total", "outcome" => "network_error")
                        .increment(1);
                    tracing::warn!(error = %e, attempt, "Backend call failed at transport level");
                    (None, e.to_string())
                }
            };

            if attempt > self.policy.retry_budget {
                counter!("volley_backend_retries_exhausted_total").increment(1);
                histogram!("volley_backend_call_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Err(BackendError::Exhausted {
                    attempts: attempt,
                    last_status,
                    last_error,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production backend over HTTP using reqwest.
///
/// Posts each item's payload to a single configured completions URL. A
/// reverse-proxy load balancer in front of backend replicas is invisible
/// here; this client only sees the one endpoint.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: None,
        }
    }

    /// Set an API key to send in the `Authorization: Bearer` header.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    #[tracing::instrument(skip(self, item), fields(item_id = %item.id))]
    async fn invoke(&self, item: &ItemData, timeout: Duration) -> Result<BackendResponse> {
        tracing::debug!(url = %self.url, timeout_ms = timeout.as_millis() as u64, "Invoking backend");

        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(item.payload.clone());

        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(url = %self.url, error = %e, "Backend request failed");
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "Backend call completed");

        Ok(BackendResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Mock inference backend for testing.
///
/// Responses are keyed by the exact payload string, with a FIFO queue per
/// key and an optional repeating default. An artificial delay on the default
/// response makes in-flight concurrency observable in tests.
#[derive(Clone)]
pub struct MockBackend {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    default_response: Arc<Mutex<Option<BackendResponse>>>,
    default_delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    /// Immediate response
    Immediate(BackendResponse),
    /// Transport-level error (retryable from the client's point of view)
    NetworkError(String),
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: BackendResponse,
        trigger: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    },
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            default_response: Arc::new(Mutex::new(None)),
            default_delay: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a response for a specific payload. Multiple responses for the
    /// same payload are returned in FIFO order.
    pub fn add_response(&self, payload: &str, response: BackendResponse) {
        self.responses
            .lock()
            .entry(payload.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Add a transport-level error for a specific payload.
    pub fn add_network_error(&self, payload: &str, message: &str) {
        self.responses
            .lock()
            .entry(payload.to_string())
            .or_default()
            .push(MockResponse::NetworkError(message.to_string()));
    }

    /// Add a response that waits for a manual trigger before completing.
    ///
    /// Returns a sender that, when triggered (by sending `()` or dropping),
    /// causes the call to complete with the given response.
    pub fn add_response_with_trigger(
        &self,
        payload: &str,
        response: BackendResponse,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(payload.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: Arc::new(Mutex::new(Some(rx))),
            });
        tx
    }

    /// Set a repeating response used when no keyed response matches.
    pub fn set_default_response(&self, response: BackendResponse) {
        *self.default_response.lock() = Some(response);
    }

    /// Delay applied before returning the default response. Useful for
    /// keeping calls observably in flight.
    pub fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.lock() = Some(delay);
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Payloads of all calls made so far.
    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever observed executing simultaneously.
    pub fn max_in_flight_count(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn invoke(&self, item: &ItemData, _timeout: Duration) -> Result<BackendResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        // Guard so the counter drops even if the task is cancelled
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(item.payload.clone());

        let mock_response = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&item.payload) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => Ok(response),
            Some(MockResponse::NetworkError(message)) => {
                Err(crate::error::VolleyError::Other(anyhow::anyhow!(message)))
            }
            Some(MockResponse::Triggered { response, trigger }) => {
                let rx = trigger.lock().take();
                if let Some(rx) = rx {
                    // Wait for trigger (proceed either way if the sender drops)
                    let _ = rx.await;
                }
                Ok(response)
            }
            None => {
                let default = self.default_response.lock().clone();
                match default {
                    Some(response) => {
                        let delay = *self.default_delay.lock();
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        Ok(response)
                    }
                    None => Err(crate::error::VolleyError::Other(anyhow::anyhow!(
                        "No mock response configured for payload {}",
                        item.payload
                    ))),
                }
            }
        }
    }
}
