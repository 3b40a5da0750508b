//! Exponential-backoff policy for request retries.
//!
//! [`compute_next_delay`] is pure so the schedule can be tested without
//! sleeping; [`with_jitter`] adds the random spread separately.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for retrying a failed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound of the uniformly random extra delay.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Delay before retry number `attempt + 1`, where `attempt` is the
/// zero-based index of the attempt that just failed.
///
/// `min(initial_delay × multiplier^attempt, max_delay)`
pub fn compute_next_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay_ms = config.initial_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    let max_ms = config.max_delay.as_millis() as f64;

    if !delay_ms.is_finite() || delay_ms >= max_ms {
        return config.max_delay;
    }
    Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// `delay` plus a uniformly random amount in `[0, max_jitter]`.
pub fn with_jitter(delay: Duration, max_jitter: Duration) -> Duration {
    let jitter_ms = max_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}
