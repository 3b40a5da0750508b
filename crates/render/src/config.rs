//! Client configuration loaded from environment variables.
//!
//! | Variable                             | Default                   |
//! |--------------------------------------|---------------------------|
//! | `RENDER_API_URL`                     | `http://localhost:8000`   |
//! | `RENDER_WS_URL`                      | derived from the API URL  |
//! | `RENDER_API_KEY`                     | unset                     |
//! | `RENDER_TIMEOUT_SECS`                | `30`                      |
//! | `RENDER_MAX_RETRIES`                 | `3`                       |
//! | `RENDER_BREAKER_FAILURE_THRESHOLD`   | `5`                       |
//! | `RENDER_BREAKER_RESET_SECS`          | `60`                      |
//! | `UPLOAD_MAX_CONCURRENCY`             | `10`                      |
//! | `UPLOAD_MAX_FILE_BYTES`              | `52428800` (50 MiB)       |
//! | `JOB_PUSH_GRACE_MS`                  | `3000`                    |
//! | `JOB_POLL_INTERVAL_MS`               | `2000`                    |
//!
//! Backoff delays and the half-open success count keep their defaults;
//! set them on [`ClientConfig::resilience`] when needed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use atelier_core::upload::UploadPolicy;

use crate::api::RenderApi;
use crate::facade::JobSubmitter;
use crate::http::ReqwestHttpClient;
use crate::push::WsPushChannel;
use crate::resilient::{ResilienceConfig, ResilientClient};
use crate::tracker::{JobTracker, TrackerConfig};
use crate::upload::{UploadCoordinator, DEFAULT_MAX_CONCURRENCY};

const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything needed to build the render clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// HTTP base URL of the render service.
    pub api_url: String,
    /// WebSocket base URL of the push channel.
    pub ws_url: String,
    pub api_key: Option<String>,
    pub resilience: ResilienceConfig,
    pub upload_max_concurrency: usize,
    pub upload_policy: UploadPolicy,
    pub tracker: TrackerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            api_key: None,
            resilience: ResilienceConfig::default(),
            upload_max_concurrency: DEFAULT_MAX_CONCURRENCY,
            upload_policy: UploadPolicy::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable or `None` when it is unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("RENDER_API_URL")
            .unwrap_or(defaults.api_url)
            .trim_end_matches('/')
            .to_string();
        let ws_url = get("RENDER_WS_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_url));
        let api_key = get("RENDER_API_KEY");

        let mut resilience = defaults.resilience;
        resilience.timeout = Duration::from_secs(positive(
            &get,
            "RENDER_TIMEOUT_SECS",
            resilience.timeout.as_secs(),
        )?);
        resilience.retry.max_retries =
            parse(&get, "RENDER_MAX_RETRIES", resilience.retry.max_retries)?;
        resilience.breaker.failure_threshold = positive(
            &get,
            "RENDER_BREAKER_FAILURE_THRESHOLD",
            resilience.breaker.failure_threshold,
        )?;
        resilience.breaker.reset_timeout = Duration::from_secs(parse(
            &get,
            "RENDER_BREAKER_RESET_SECS",
            resilience.breaker.reset_timeout.as_secs(),
        )?);

        let upload_max_concurrency =
            positive(&get, "UPLOAD_MAX_CONCURRENCY", defaults.upload_max_concurrency)?;
        let upload_policy = UploadPolicy {
            max_file_bytes: positive(
                &get,
                "UPLOAD_MAX_FILE_BYTES",
                defaults.upload_policy.max_file_bytes,
            )?,
            ..defaults.upload_policy
        };

        let tracker = TrackerConfig {
            grace_window: millis(&get, "JOB_PUSH_GRACE_MS", defaults.tracker.grace_window)?,
            poll_interval: millis(&get, "JOB_POLL_INTERVAL_MS", defaults.tracker.poll_interval)?,
            ..defaults.tracker
        };

        Ok(Self {
            api_url,
            ws_url,
            api_key,
            resilience,
            upload_max_concurrency,
            upload_policy,
            tracker,
        })
    }

    /// Resilient client over reqwest, with its own circuit breaker.
    pub fn resilient_client(&self) -> ResilientClient {
        let http = ReqwestHttpClient::new(self.api_url.clone()).with_api_key(self.api_key.clone());
        ResilientClient::new(Arc::new(http), self.resilience.clone())
    }

    /// Build every client sharing one resilient client (and breaker).
    pub fn build(&self) -> RenderClients {
        let api = RenderApi::new(Arc::new(self.resilient_client()));
        let push = Arc::new(WsPushChannel::new(self.ws_url.clone()));
        let tracker = JobTracker::new(api.clone(), push, self.tracker.clone());
        RenderClients {
            uploads: UploadCoordinator::new(
                api.clone(),
                self.upload_policy.clone(),
                self.upload_max_concurrency,
            ),
            submitter: JobSubmitter::new(api.clone(), tracker),
            api,
        }
    }
}

/// Clients built from one [`ClientConfig`].
#[derive(Clone)]
pub struct RenderClients {
    pub api: RenderApi,
    pub uploads: UploadCoordinator,
    pub submitter: JobSubmitter,
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`.
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, var, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, var, default.as_millis() as u64).map(Duration::from_millis)
}
