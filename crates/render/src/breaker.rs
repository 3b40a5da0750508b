//! Circuit breaker owned by one [`ResilientClient`](crate::resilient::ResilientClient).
//!
//! The breaker is a plain state machine: every method takes the current
//! [`Instant`] so transitions can be tested without waiting. The client
//! wraps it in a mutex that is never held across an `.await`.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Tunable thresholds of the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures (net of decrements by successes) that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// How a call was let through by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The call holds the single half-open trial slot and must report an
    /// outcome or give the slot back.
    Trial,
}

/// Returned by [`CircuitBreaker::try_acquire`] when a call may not proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub state: CircuitState,
    /// Time until the next trial call may be attempted.
    pub retry_in: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_success_count: u32,
    /// A half-open trial call is outstanding; no other call may pass.
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            half_open_success_count: 0,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask permission to send one request at `now`.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and lets exactly one trial call through; further calls are
    /// rejected until that trial reports its outcome.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, Rejected> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let since = self
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.config.reset_timeout);
                if since >= self.config.reset_timeout {
                    tracing::info!("Circuit half-open, allowing trial request");
                    self.state = CircuitState::HalfOpen;
                    self.half_open_success_count = 0;
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(Rejected {
                        state: CircuitState::Open,
                        retry_in: self.config.reset_timeout - since,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Rejected {
                        state: CircuitState::HalfOpen,
                        retry_in: Duration::ZERO,
                    })
                } else {
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Whether a call at `now` would be let through, without claiming the
    /// half-open trial slot.
    pub fn would_allow(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => self
                .last_failure_at
                .map(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
                .unwrap_or(true),
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.half_open_success_count += 1;
                if self.half_open_success_count >= self.config.half_open_successes {
                    tracing::info!("Circuit closed after successful trials");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.half_open_success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = self.failure_count,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit opened",
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Trial request failed, circuit re-opened");
                self.state = CircuitState::Open;
                self.trial_in_flight = false;
                self.half_open_success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Release a half-open trial slot without counting the outcome either
    /// way (the service answered, but with a caller error).
    pub fn record_neutral(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
