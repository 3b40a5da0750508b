#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use atelier_render::backoff::RetryConfig;
use atelier_render::breaker::BreakerConfig;
use atelier_render::http::{HttpRequest, MockHttpClient, RequestBody};
use atelier_render::messages::{parse_status, JobStatusPayload};
use atelier_render::resilient::{ResilienceConfig, ResilientClient};
use atelier_render::RenderApi;

/// Resilience settings with short, jitter-free delays.
pub fn test_resilience(max_retries: u32, failure_threshold: u32) -> ResilienceConfig {
    ResilienceConfig {
        timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
        },
        breaker: BreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_secs(60),
            half_open_successes: 3,
        },
    }
}

pub fn test_client(mock: &MockHttpClient, config: ResilienceConfig) -> Arc<ResilientClient> {
    Arc::new(ResilientClient::new(Arc::new(mock.clone()), config))
}

pub fn test_api(mock: &MockHttpClient) -> RenderApi {
    RenderApi::new(test_client(mock, test_resilience(0, 100)))
}

/// Parse a job status body, panicking on malformed test input.
pub fn status(json: &str) -> JobStatusPayload {
    parse_status(json).expect("valid status payload")
}

/// File name of a multipart request, if any.
pub fn uploaded_file_name(request: &HttpRequest) -> Option<&str> {
    match &request.body {
        RequestBody::Multipart { file, .. } => Some(file.file_name.as_str()),
        _ => None,
    }
}
