//! Typed client for the render service endpoints.
//!
//! Wraps render submission (sync and async), job status polling, remote
//! cancellation and file ingestion on top of a shared
//! [`ResilientClient`].

use std::sync::Arc;

use atelier_core::generation::{OutputFormat, ValidatedRequest};
use atelier_core::types::JobId;
use atelier_core::upload::IngestResult;
use atelier_core::CoreError;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::backoff::RetryConfig;
use crate::http::{FilePart, HttpRequest, HttpResponse, ProgressFn};
use crate::messages::{parse_status, JobStatusPayload};
use crate::resilient::{RequestError, ResilientClient};

/// Multipart field carrying the uploaded file.
pub const INGEST_FILE_FIELD: &str = "file";

/// Body of `POST /render` and `POST /render/async`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderPayload {
    pub project_id: String,
    pub prompt: String,
    pub output_count: u8,
    pub format: String,
    pub dimensions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

impl From<&ValidatedRequest> for RenderPayload {
    fn from(request: &ValidatedRequest) -> Self {
        let format = match request.format {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        };
        Self {
            project_id: request.project_id.clone(),
            prompt: request.prompt.clone(),
            output_count: request.variant_count,
            format: format.to_string(),
            dimensions: request.dimensions.to_string(),
            constraints: request.constraints.clone(),
        }
    }
}

/// Response of the synchronous `POST /render`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RenderResponse {
    /// Asset URLs, one per produced variant, in variant order.
    pub assets: Vec<String>,
    /// Provenance metadata recorded by the service.
    #[serde(default)]
    pub audit: Option<serde_json::Value>,
}

/// Response of `POST /render/async`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AsyncSubmitResponse {
    pub job_id: JobId,
}

/// Errors from the render API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request failed (breaker, timeout, transport or non-2xx status).
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The request could not be built.
    #[error("Could not encode request to {path}: {reason}")]
    Encode { path: String, reason: String },

    /// The service answered 2xx with a body that does not match the
    /// expected shape.
    #[error("Could not decode response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ApiError> for CoreError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Request(e) => e.into(),
            ApiError::Encode { .. } | ApiError::Decode { .. } => {
                CoreError::Unexpected(err.to_string())
            }
        }
    }
}

/// Render service client. Cheap to clone; clones share the resilient
/// client and therefore its circuit breaker.
#[derive(Clone)]
pub struct RenderApi {
    client: Arc<ResilientClient>,
}

impl RenderApi {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    /// Render synchronously and wait for the asset URLs.
    pub async fn render(&self, request: &ValidatedRequest) -> Result<RenderResponse, ApiError> {
        let body = Self::encode("/render", &RenderPayload::from(request))?;
        let response = self
            .client
            .request(&HttpRequest::post_json("/render", body), None)
            .await?;
        Self::decode("/render", &response)
    }

    /// Queue a render and return the job id to track.
    pub async fn render_async(&self, request: &ValidatedRequest) -> Result<JobId, ApiError> {
        let body = Self::encode("/render/async", &RenderPayload::from(request))?;
        let response = self
            .client
            .request(&HttpRequest::post_json("/render/async", body), None)
            .await?;
        let submitted: AsyncSubmitResponse = Self::decode("/render/async", &response)?;
        tracing::info!(job_id = %submitted.job_id, "Render job queued");
        Ok(submitted.job_id)
    }

    /// Fetch the current status of a job.
    ///
    /// `retry` overrides the client's retry policy for this call.
    pub async fn job_status(
        &self,
        job_id: &str,
        retry: Option<&RetryConfig>,
    ) -> Result<JobStatusPayload, ApiError> {
        let path = job_path(job_id, &[])?;
        let response = self.client.request(&HttpRequest::get(&path), retry).await?;
        parse_status(&response.body).map_err(|source| ApiError::Decode { path, source })
    }

    /// Ask the service to cancel a queued or running job.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), ApiError> {
        let path = job_path(job_id, &["cancel"])?;
        self.client
            .request(&HttpRequest::post_json(path, serde_json::json!({})), None)
            .await?;
        Ok(())
    }

    /// Upload one file as multipart `project_id` + `file`.
    ///
    /// `progress` receives `(bytes_sent, bytes_total)` while the body is
    /// streamed.
    pub async fn ingest_file(
        &self,
        project_id: &str,
        file: FilePart,
        progress: Option<ProgressFn>,
    ) -> Result<IngestResult, ApiError> {
        let mut request = HttpRequest::post_multipart(
            "/ingest/file",
            vec![("project_id".to_string(), project_id.to_string())],
            file,
        );
        if let Some(progress) = progress {
            request = request.with_progress(progress);
        }
        let response = self.client.request(&request, None).await?;
        Self::decode("/ingest/file", &response)
    }

    // ---- private helpers ----

    fn encode<T: Serialize>(path: &str, payload: &T) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(payload).map_err(|e| ApiError::Encode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(
        path: &str,
        response: &HttpResponse,
    ) -> Result<T, ApiError> {
        serde_json::from_str(&response.body).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }
}

/// `/render/jobs/{job_id}` followed by `tail`, each segment
/// percent-encoded.
fn job_path(job_id: &str, tail: &[&str]) -> Result<String, ApiError> {
    let invalid = |reason: String| ApiError::Encode {
        path: format!("/render/jobs/{job_id}"),
        reason,
    };
    let mut url = Url::parse("http://render.local/").map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("URL cannot carry a path".to_string()))?
        .pop_if_empty()
        .extend(["render", "jobs", job_id])
        .extend(tail);
    Ok(url.path().to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use atelier_core::generation::{validate_request, GenerationRequest};
    use atelier_core::ErrorKind;

    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::http::{MockHttpClient, MockReply};
    use crate::messages::RemoteStatus;
    use crate::resilient::ResilienceConfig;

    fn api(mock: &MockHttpClient) -> RenderApi {
        RenderApi::new(Arc::new(ResilientClient::new(
            Arc::new(mock.clone()),
            ResilienceConfig {
                timeout: Duration::from_secs(5),
                retry: RetryConfig::none(),
                breaker: BreakerConfig::default(),
            },
        )))
    }

    fn request() -> ValidatedRequest {
        validate_request(&GenerationRequest {
            project_id: "p1".into(),
            prompt: "  A red fox in the snow  ".into(),
            variant_count: 2,
            format: "JPG".into(),
            dimensions: "1024x768".into(),
            constraints: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn render_sends_normalized_payload() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /render",
            MockReply::json(
                200,
                serde_json::json!({"assets": ["https://cdn/a.jpeg", "https://cdn/b.jpeg"], "audit": {"model": "v2"}}),
            ),
        );

        let response = api(&mock).render(&request()).await.unwrap();
        assert_eq!(response.assets.len(), 2);

        let sent = mock.calls()[0].json.clone().unwrap();
        assert_eq!(sent["prompt"], "A red fox in the snow");
        assert_eq!(sent["output_count"], 2);
        assert_eq!(sent["format"], "jpeg");
        assert_eq!(sent["dimensions"], "1024x768");
        assert!(sent.get("constraints").is_none());
    }

    #[tokio::test]
    async fn render_async_returns_job_id() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /render/async",
            MockReply::json(202, serde_json::json!({"job_id": "job-42"})),
        );

        let job_id = api(&mock).render_async(&request()).await.unwrap();
        assert_eq!(job_id, "job-42");
    }

    #[tokio::test]
    async fn job_status_decodes_payload() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "GET /render/jobs/job-42",
            MockReply::json(200, serde_json::json!({"status": "running", "progress": 40})),
        );

        let status = api(&mock).job_status("job-42", None).await.unwrap();
        assert_eq!(status.status, RemoteStatus::Running);
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /render", MockReply::status(200, "<html>oops</html>"));

        let err = api(&mock).render(&request()).await.unwrap_err();
        assert_matches!(err, ApiError::Decode { ref path, .. } if path == "/render");
        assert_eq!(CoreError::from(err).kind(), ErrorKind::Unexpected);
    }

    #[tokio::test]
    async fn cancel_posts_to_job_cancel_endpoint() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /render/jobs/job-42/cancel", MockReply::status(204, ""));

        api(&mock).cancel_job("job-42").await.unwrap();
        assert_eq!(mock.calls()[0].path, "/render/jobs/job-42/cancel");
    }

    #[tokio::test]
    async fn ingest_sends_project_and_file() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /ingest/file",
            MockReply::json(200, serde_json::json!({"processed": 1, "ids": ["doc-1"]})),
        );

        let file = FilePart {
            field: INGEST_FILE_FIELD.into(),
            file_name: "brief.pdf".into(),
            mime_type: "application/pdf".into(),
            data: Arc::new(b"%PDF-1.7".to_vec()),
        };
        let result = api(&mock).ingest_file("p1", file, None).await.unwrap();
        assert_eq!(result.ids, vec!["doc-1".to_string()]);

        let call = &mock.calls()[0];
        assert_eq!(call.fields, vec![("project_id".to_string(), "p1".to_string())]);
        assert_eq!(call.file_name.as_deref(), Some("brief.pdf"));
    }

    #[tokio::test]
    async fn job_id_is_encoded_as_one_segment() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "GET /render/jobs/a%2Fb%20c%3Fx",
            MockReply::json(200, serde_json::json!({"status": "running"})),
        );
        mock.add_reply("POST /render/jobs/a%2Fb%20c%3Fx/cancel", MockReply::status(204, ""));

        let api = api(&mock);
        api.job_status("a/b c?x", None).await.unwrap();
        api.cancel_job("a/b c?x").await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn unserializable_body_is_an_encode_error() {
        let mut body = std::collections::HashMap::new();
        body.insert((1u8, 2u8), "tuple keys are not JSON object keys");

        let err = RenderApi::encode("/render", &body).unwrap_err();
        assert_matches!(err, ApiError::Encode { ref path, .. } if path == "/render");
        assert_eq!(CoreError::from(err).kind(), ErrorKind::Unexpected);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_core_error() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /render/async",
            MockReply::json(429, serde_json::json!({"detail": "Too many renders"})),
        );

        let err = api(&mock).render_async(&request()).await.unwrap_err();
        let core = CoreError::from(err);
        assert_eq!(core.kind(), ErrorKind::RateLimited);
    }
}
