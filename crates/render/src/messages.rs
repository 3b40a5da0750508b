//! Job status payloads shared by the polling endpoint and the push
//! channel, and their conversion into sequence-numbered [`JobUpdate`]s.
//!
//! Push frames are JSON envelopes of the shape
//! `{"type": "<kind>", "data": {...}}`; the polling endpoint returns the
//! bare `data` object.

use atelier_core::job::{Artifact, JobEvent, JobUpdate};
use serde::Deserialize;

/// Job status as reported by the render service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    #[serde(alias = "queued", alias = "pending")]
    Submitted,
    #[serde(alias = "processing", alias = "in_progress")]
    Running,
    #[serde(alias = "succeeded", alias = "done")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

/// Body of `GET /render/jobs/{id}` and of `job_status` push frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobStatusPayload {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: RemoteStatus,
    /// Completion percentage (0-100).
    #[serde(default)]
    pub progress: Option<f64>,
    /// Single delivered output; `index` says which variant it is.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "seq")]
    pub sequence: Option<u64>,
    /// Milliseconds since the Unix epoch; orders updates when `sequence`
    /// is absent.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Field a job's updates are ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingScheme {
    Sequence,
    Timestamp,
}

impl JobStatusPayload {
    /// Ordering key carried by the payload; `sequence` wins over
    /// `timestamp`.
    pub fn ordering_key(&self) -> Option<(OrderingScheme, u64)> {
        match (self.sequence, self.timestamp) {
            (Some(sequence), _) => Some((OrderingScheme::Sequence, sequence)),
            (None, Some(timestamp)) => Some((OrderingScheme::Timestamp, timestamp)),
            (None, None) => None,
        }
    }

    /// Sequence number carried by the payload, if any.
    pub fn carried_sequence(&self) -> Option<u64> {
        self.ordering_key().map(|(_, value)| value)
    }

    /// Convert into a [`JobUpdate`], using `fallback_sequence` when the
    /// payload carries neither a sequence nor a timestamp.
    pub fn into_update(self, fallback_sequence: u64) -> JobUpdate {
        let sequence = self.carried_sequence().unwrap_or(fallback_sequence);
        let progress = self
            .progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0) as u8)
            .unwrap_or(0);

        let mut artifacts = self.artifacts;
        if let Some(url) = self.url {
            let index = self.index.unwrap_or(0);
            if !artifacts.iter().any(|a| a.index == index) {
                artifacts.push(Artifact { index, url });
            }
        }

        let event = match self.status {
            RemoteStatus::Submitted => JobEvent::Submitted,
            RemoteStatus::Running => JobEvent::Running {
                progress,
                artifacts,
            },
            RemoteStatus::Completed => JobEvent::Completed { artifacts },
            RemoteStatus::Failed => JobEvent::Failed {
                message: self
                    .error
                    .unwrap_or_else(|| "Render failed without a reason".to_string()),
            },
            RemoteStatus::Cancelled => JobEvent::Cancelled,
        };

        JobUpdate::new(sequence, event)
    }
}

/// All known push-channel frame types.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushMessage {
    /// Status/progress of the subscribed job.
    #[serde(rename = "job_status")]
    JobStatus(JobStatusPayload),

    /// Keep-alive; carries no job information.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Assigns sequence numbers to one job's payloads.
///
/// The first ordering key seen fixes the scheme for the job. A payload
/// keyed by the other scheme is numbered as if it carried no key, so a
/// millisecond timestamp can never outrank every later sequence number.
#[derive(Debug, Default)]
pub struct SequenceResolver {
    scheme: Option<OrderingScheme>,
}

impl SequenceResolver {
    pub fn scheme(&self) -> Option<OrderingScheme> {
        self.scheme
    }

    /// Sequence for `payload`, or `fallback` when it carries no usable key.
    pub fn resolve(&mut self, payload: &JobStatusPayload, fallback: u64) -> u64 {
        let Some((scheme, value)) = payload.ordering_key() else {
            return fallback;
        };
        let fixed = *self.scheme.get_or_insert(scheme);
        if fixed == scheme {
            value
        } else {
            tracing::warn!(?fixed, ?scheme, "Payload ordered by a different key, numbering it locally");
            fallback
        }
    }
}

/// Parse a push-channel text frame.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log and continue.
pub fn parse_message(text: &str) -> Result<PushMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Parse the body of the polling endpoint.
pub fn parse_status(body: &str) -> Result<JobStatusPayload, serde_json::Error> {
    serde_json::from_str(body)
}
