//! Resilient request client: per-attempt timeout, retry with exponential
//! backoff and jitter, and a circuit breaker.
//!
//! One [`ResilientClient`] owns one [`CircuitBreaker`]. Share the client
//! through an `Arc`; construct it explicitly wherever a separate breaker
//! is wanted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use atelier_core::{CoreError, ErrorKind};
use tokio::time::Instant;

use crate::backoff::{compute_next_delay, with_jitter, RetryConfig};
use crate::breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitState};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// Statuses worth retrying: request timeout, rate limiting and transient
/// server failures.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Budget for a single attempt; the transport is dropped when it expires.
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// What made the last attempt fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    /// The breaker refused the call; nothing was sent.
    #[error("circuit {state}, next attempt allowed in {retry_in:?}")]
    CircuitOpen {
        state: CircuitState,
        retry_in: Duration,
    },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Transport(String),
}

impl FailureCause {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => false,
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::ServiceUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Status { status, .. } => match *status {
                408 => ErrorKind::Timeout,
                429 => ErrorKind::RateLimited,
                400 | 422 => ErrorKind::Validation,
                500..=599 => ErrorKind::Server,
                _ => ErrorKind::Unexpected,
            },
        }
    }
}

/// Final failure of [`ResilientClient::request`], annotated with the
/// breaker state and whether the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method} {path} failed after {attempts} attempt(s): {cause}")]
pub struct RequestError {
    pub method: String,
    pub path: String,
    pub cause: FailureCause,
    /// Attempts that reached the transport.
    pub attempts: u32,
    pub retries_exhausted: bool,
    /// Breaker state when the error was raised.
    pub circuit: CircuitState,
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }

    pub fn status(&self) -> Option<u16> {
        match &self.cause {
            FailureCause::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RequestError> for CoreError {
    fn from(err: RequestError) -> Self {
        match &err.cause {
            FailureCause::Status { status, body } => {
                let message = server_message(body);
                match err.kind() {
                    ErrorKind::Server => CoreError::Server {
                        status: *status,
                        message,
                    },
                    kind => CoreError::from_kind(kind, message),
                }
            }
            _ => CoreError::from_kind(err.kind(), err.to_string()),
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"detail": ...}`, `{"error": ...}` and `{"message": ...}`
/// JSON bodies; anything else is returned as-is.
pub fn server_message(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(serde_json::Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    body.trim().to_string()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ResilientClient {
    http: Arc<dyn HttpClient>,
    config: ResilienceConfig,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientClient {
    pub fn new(http: Arc<dyn HttpClient>, config: ResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            http,
            config,
            breaker: Mutex::new(breaker),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker().state()
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        lock(&self.breaker)
    }

    fn fail(
        &self,
        request: &HttpRequest,
        cause: FailureCause,
        attempts: u32,
        retries_exhausted: bool,
    ) -> RequestError {
        RequestError {
            method: request.method.to_string(),
            path: request.path.clone(),
            cause,
            attempts,
            retries_exhausted,
            circuit: self.circuit_state(),
        }
    }

    /// Send `request`, retrying transient failures.
    ///
    /// `retry` overrides the client's default retry policy for this call.
    /// Non-2xx responses are returned as errors.
    #[tracing::instrument(skip(self, request, retry), fields(method = %request.method, path = %request.path))]
    pub async fn request(
        &self,
        request: &HttpRequest,
        retry: Option<&RetryConfig>,
    ) -> Result<HttpResponse, RequestError> {
        let retry = retry.unwrap_or(&self.config.retry);
        let mut attempt: u32 = 0;

        loop {
            let acquired = self.breaker().try_acquire(Instant::now());
            let permit = match acquired {
                Ok(admission) => Permit {
                    breaker: &self.breaker,
                    trial: admission == Admission::Trial,
                },
                Err(rejected) => {
                    tracing::warn!(
                        circuit = %rejected.state,
                        retry_in_ms = rejected.retry_in.as_millis() as u64,
                        "Request rejected by circuit breaker",
                    );
                    return Err(self.fail(
                        request,
                        FailureCause::CircuitOpen {
                            state: rejected.state,
                            retry_in: rejected.retry_in,
                        },
                        attempt,
                        false,
                    ));
                }
            };

            let started = Instant::now();
            let outcome = tokio::time::timeout(self.config.timeout, self.http.execute(request)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let cause = match outcome {
                Ok(Ok(response)) if response.is_success() => {
                    permit.settle(CircuitBreaker::record_success);
                    tracing::debug!(attempt, elapsed_ms, status = response.status, "Request succeeded");
                    return Ok(response);
                }
                Ok(Ok(response)) => FailureCause::Status {
                    status: response.status,
                    body: response.body,
                },
                Ok(Err(e)) => FailureCause::Transport(e.to_string()),
                Err(_) => FailureCause::Timeout(self.config.timeout),
            };

            let retryable = cause.is_retryable();
            if retryable {
                permit.settle(|b| b.record_failure(Instant::now()));
            } else {
                permit.settle(CircuitBreaker::record_neutral);
            }

            tracing::warn!(
                attempt,
                elapsed_ms,
                retryable,
                error = %cause,
                "Request attempt failed",
            );

            let attempts_made = attempt + 1;
            if !retryable {
                return Err(self.fail(request, cause, attempts_made, false));
            }
            if attempt >= retry.max_retries {
                tracing::error!(attempts = attempts_made, error = %cause, "Retries exhausted");
                return Err(self.fail(request, cause, attempts_made, true));
            }

            let delay = with_jitter(compute_next_delay(attempt, retry), retry.max_jitter);
            if !self.breaker().would_allow(Instant::now() + delay) {
                tracing::warn!("Circuit open, giving up before retry");
                return Err(self.fail(request, cause, attempts_made, false));
            }

            tracing::debug!(delay_ms = delay.as_millis() as u64, "Retrying after backoff");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Breaker admission held for the duration of one attempt. A half-open
/// trial dropped before it reports an outcome gives its slot back.
struct Permit<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    trial: bool,
}

impl Permit<'_> {
    fn settle(mut self, record: impl FnOnce(&mut CircuitBreaker)) {
        self.trial = false;
        record(&mut *lock(self.breaker));
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            tracing::debug!("Trial request abandoned, releasing half-open slot");
            lock(self.breaker).record_neutral();
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::http::{MockHttpClient, MockReply};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
        }
    }

    fn client(mock: &MockHttpClient, retry: RetryConfig) -> ResilientClient {
        ResilientClient::new(
            Arc::new(mock.clone()),
            ResilienceConfig {
                timeout: Duration::from_secs(5),
                retry,
                breaker: BreakerConfig::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let mock = MockHttpClient::new();
        mock.add_reply("GET /x", MockReply::status(503, "busy"));
        mock.add_reply("GET /x", MockReply::transport("reset"));
        mock.add_reply("GET /x", MockReply::status(200, "ok"));

        let c = client(&mock, fast_retry(3));
        let response = c.request(&HttpRequest::get("/x"), None).await.unwrap();
        assert_eq!(response.body, "ok");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delays_follow_backoff_schedule() {
        let mock = MockHttpClient::new();
        for _ in 0..3 {
            mock.add_reply("GET /x", MockReply::status(500, "down"));
        }
        mock.add_reply("GET /x", MockReply::status(200, "ok"));

        let c = client(&mock, fast_retry(3));
        c.request(&HttpRequest::get("/x"), None).await.unwrap();

        let calls = mock.calls();
        let gaps: Vec<u128> = calls
            .windows(2)
            .map(|w| (w[1].at - w[0].at).as_millis())
            .collect();
        assert_eq!(gaps, vec![100, 200, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_fails_immediately() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /render", MockReply::status(404, "missing"));

        let c = client(&mock, fast_retry(3));
        let err = c
            .request(&HttpRequest::post_json("/render", serde_json::json!({})), None)
            .await
            .unwrap_err();

        assert_eq!(mock.call_count(), 1);
        assert_eq!(err.attempts, 1);
        assert!(!err.retries_exhausted);
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(c.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_flagged() {
        let mock = MockHttpClient::new();
        mock.set_responder(|_| MockReply::status(429, "slow down"));

        let c = client(&mock, fast_retry(2));
        let err = c.request(&HttpRequest::get("/x"), None).await.unwrap_err();

        assert_eq!(mock.call_count(), 3);
        assert_eq!(err.attempts, 3);
        assert!(err.retries_exhausted);
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "GET /slow",
            MockReply::status(200, "late").after(Duration::from_secs(60)),
        );

        let c = client(&mock, RetryConfig::none());
        let err = c.request(&HttpRequest::get("/slow"), None).await.unwrap_err();
        assert_matches!(err.cause, FailureCause::Timeout(d) if d == Duration::from_secs(5));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_retry_override_is_used() {
        let mock = MockHttpClient::new();
        mock.set_responder(|_| MockReply::status(502, "bad gateway"));

        let c = client(&mock, fast_retry(3));
        let err = c
            .request(&HttpRequest::get("/x"), Some(&RetryConfig::none()))
            .await
            .unwrap_err();
        assert_eq!(mock.call_count(), 1);
        assert!(err.retries_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_stops_retry_loop() {
        let mock = MockHttpClient::new();
        mock.set_responder(|_| MockReply::status(503, "down"));

        let c = ResilientClient::new(
            Arc::new(mock.clone()),
            ResilienceConfig {
                timeout: Duration::from_secs(5),
                retry: fast_retry(10),
                breaker: BreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
            },
        );

        let err = c.request(&HttpRequest::get("/x"), None).await.unwrap_err();
        assert_eq!(mock.call_count(), 2);
        assert_eq!(err.circuit, CircuitState::Open);
        assert!(!err.retries_exhausted);
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[test]
    fn status_classification() {
        let status = |s: u16| FailureCause::Status {
            status: s,
            body: String::new(),
        };
        assert!(status(408).is_retryable());
        assert!(status(504).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(501).is_retryable());
        assert_eq!(status(422).kind(), ErrorKind::Validation);
        assert_eq!(status(501).kind(), ErrorKind::Server);
    }

    #[test]
    fn core_error_conversion_extracts_server_message() {
        let err = RequestError {
            method: "POST".into(),
            path: "/render".into(),
            cause: FailureCause::Status {
                status: 422,
                body: r#"{"detail":"prompt rejected by policy"}"#.into(),
            },
            attempts: 1,
            retries_exhausted: false,
            circuit: CircuitState::Closed,
        };
        let core: CoreError = err.into();
        assert_eq!(core, CoreError::Validation("prompt rejected by policy".into()));
    }
}
