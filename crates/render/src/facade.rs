//! Entry point used by the composer UI to submit generation requests.
//!
//! Every request is validated before anything is sent. Failures come back
//! as [`CoreError`] so the caller can show
//! [`CoreError::user_message`] without inspecting transport details.

use atelier_core::generation::{validate_request, GenerationRequest, ValidatedRequest};
use atelier_core::job::JobState;
use atelier_core::variants::{variant_slots, VariantSlot};
use atelier_core::CoreError;
use tokio::sync::watch;

use crate::api::{RenderApi, RenderResponse};
use crate::tracker::{JobHandle, JobTracker};

/// How the caller wants the render to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Wait for the assets in the submitting call.
    Sync,
    /// Return immediately with a tracked job.
    #[default]
    Async,
}

/// Outcome of [`JobSubmitter::submit`].
pub enum Submission {
    Completed(RenderResponse),
    Tracking(TrackedJob),
}

/// An asynchronous job under tracking, with the variant count the UI
/// lays slots out for.
pub struct TrackedJob {
    handle: JobHandle,
    variant_count: u8,
}

impl TrackedJob {
    pub fn job_id(&self) -> &str {
        self.handle.job_id()
    }

    pub fn variant_count(&self) -> u8 {
        self.variant_count
    }

    pub fn snapshot(&self) -> JobState {
        self.handle.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.handle.subscribe()
    }

    /// Per-variant view of the current snapshot.
    pub fn slots(&self) -> Vec<VariantSlot> {
        variant_slots(&self.handle.snapshot(), self.variant_count)
    }

    /// Stop tracking locally; the service keeps the job.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn wait(&self) -> JobState {
        self.handle.wait().await
    }

    pub fn into_handle(self) -> JobHandle {
        self.handle
    }
}

/// Slots for a synchronous render, one per returned asset.
pub fn ready_slots(response: &RenderResponse) -> Vec<VariantSlot> {
    response
        .assets
        .iter()
        .map(|url| VariantSlot::Ready { url: url.clone() })
        .collect()
}

#[derive(Clone)]
pub struct JobSubmitter {
    api: RenderApi,
    tracker: JobTracker,
}

impl JobSubmitter {
    pub fn new(api: RenderApi, tracker: JobTracker) -> Self {
        Self { api, tracker }
    }

    pub fn validate(&self, request: &GenerationRequest) -> Result<ValidatedRequest, CoreError> {
        validate_request(request).inspect_err(|e| {
            tracing::debug!(error = %e, "Generation request rejected");
        })
    }

    /// Validate and render synchronously.
    #[tracing::instrument(skip_all, fields(project_id = %request.project_id))]
    pub async fn render_sync(&self, request: &GenerationRequest) -> Result<RenderResponse, CoreError> {
        let validated = self.validate(request)?;
        self.api.render(&validated).await.map_err(|e| {
            let err = CoreError::from(e);
            tracing::warn!(kind = %err.kind(), error = %err, "Synchronous render failed");
            err
        })
    }

    /// Validate, queue the render and start tracking it.
    #[tracing::instrument(skip_all, fields(project_id = %request.project_id))]
    pub async fn submit_async(&self, request: &GenerationRequest) -> Result<TrackedJob, CoreError> {
        let validated = self.validate(request)?;
        let job_id = self.api.render_async(&validated).await.map_err(|e| {
            let err = CoreError::from(e);
            tracing::warn!(kind = %err.kind(), error = %err, "Render submission failed");
            err
        })?;

        Ok(TrackedJob {
            handle: self.tracker.track(job_id),
            variant_count: validated.variant_count,
        })
    }

    pub async fn submit(
        &self,
        request: &GenerationRequest,
        mode: SubmitMode,
    ) -> Result<Submission, CoreError> {
        match mode {
            SubmitMode::Sync => self.render_sync(request).await.map(Submission::Completed),
            SubmitMode::Async => self.submit_async(request).await.map(Submission::Tracking),
        }
    }

    /// Ask the service to cancel a job. Local tracking is not affected;
    /// call [`TrackedJob::cancel`] for that.
    pub async fn cancel_remote(&self, job_id: &str) -> Result<(), CoreError> {
        self.api.cancel_job(job_id).await.map_err(|e| {
            let err = CoreError::from(e);
            tracing::warn!(job_id, kind = %err.kind(), error = %err, "Remote cancellation failed");
            err
        })?;
        tracing::info!(job_id, "Remote cancellation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use atelier_core::ErrorKind;

    use super::*;
    use crate::backoff::RetryConfig;
    use crate::breaker::BreakerConfig;
    use crate::http::{MockHttpClient, MockReply};
    use crate::push::MockPushChannel;
    use crate::resilient::{ResilienceConfig, ResilientClient};
    use crate::tracker::TrackerConfig;

    fn submitter(mock: &MockHttpClient, push: &MockPushChannel) -> JobSubmitter {
        let client = ResilientClient::new(
            Arc::new(mock.clone()),
            ResilienceConfig {
                timeout: Duration::from_secs(5),
                retry: RetryConfig::none(),
                breaker: BreakerConfig::default(),
            },
        );
        let api = RenderApi::new(Arc::new(client));
        let tracker = JobTracker::new(api.clone(), Arc::new(push.clone()), TrackerConfig::default());
        JobSubmitter::new(api, tracker)
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            project_id: "p1".into(),
            prompt: prompt.into(),
            variant_count: 2,
            format: "png".into(),
            dimensions: "1024x1024".into(),
            constraints: None,
        }
    }

    #[tokio::test]
    async fn invalid_prompt_never_reaches_the_network() {
        let mock = MockHttpClient::new();
        let s = submitter(&mock, &MockPushChannel::new());

        for prompt in ["abcd".to_string(), "x".repeat(2001)] {
            let err = s.render_sync(&request(&prompt)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            let err = s.submit_async(&request(&prompt)).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn sync_mode_returns_assets() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /render",
            MockReply::json(200, serde_json::json!({"assets": ["https://cdn/0.png", "https://cdn/1.png"]})),
        );
        let s = submitter(&mock, &MockPushChannel::new());

        let submission = s.submit(&request("A lighthouse at dusk"), SubmitMode::Sync).await.unwrap();
        match submission {
            Submission::Completed(response) => {
                assert_eq!(
                    ready_slots(&response)[1],
                    VariantSlot::Ready {
                        url: "https://cdn/1.png".into()
                    }
                );
            }
            Submission::Tracking(_) => panic!("Expected a completed render"),
        }
    }

    #[tokio::test]
    async fn rate_limit_is_classified_with_user_message() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /render", MockReply::status(429, "slow down"));
        let s = submitter(&mock, &MockPushChannel::new());

        let err = s.render_sync(&request("A lighthouse at dusk")).await.unwrap_err();
        assert_matches!(err, CoreError::RateLimited(_));
        assert!(err.user_message().contains("Rate limit"));
    }

    #[tokio::test]
    async fn async_mode_tracks_job_into_slots() {
        let mock = MockHttpClient::new();
        mock.add_reply(
            "POST /render/async",
            MockReply::json(202, serde_json::json!({"job_id": "job-9"})),
        );
        let push = MockPushChannel::new();
        let sender = push.register("job-9");
        let s = submitter(&mock, &push);

        let job = s.submit_async(&request("A lighthouse at dusk")).await.unwrap();
        assert_eq!(job.job_id(), "job-9");
        assert_eq!(job.slots(), vec![VariantSlot::Pending, VariantSlot::Pending]);

        sender.send(
            crate::messages::parse_status(
                r#"{"status":"completed","sequence":1,"artifacts":[{"index":0,"url":"https://cdn/0.png"}]}"#,
            )
            .unwrap(),
        );
        let state = job.wait().await;
        assert!(state.is_terminal());
        assert_eq!(
            job.slots(),
            vec![
                VariantSlot::Ready {
                    url: "https://cdn/0.png".into()
                },
                VariantSlot::Failed {
                    message: "No output was produced for this variant".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn cancel_remote_posts_cancel() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /render/jobs/job-9/cancel", MockReply::status(200, "{}"));
        let s = submitter(&mock, &MockPushChannel::new());

        s.cancel_remote("job-9").await.unwrap();
        assert_eq!(mock.call_count(), 1);
    }
}
