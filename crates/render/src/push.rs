//! Push channel delivering job status updates as they happen.
//!
//! [`PushChannel::subscribe`] opens one subscription per job and yields
//! parsed [`JobStatusPayload`]s. The stream ends when the server closes
//! the subscription; a transport failure is yielded once as `Err` and
//! then the stream ends. Dropping the stream closes the subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::messages::{parse_message, JobStatusPayload, PushMessage};

/// Stream of status payloads for one job.
pub type PushStream = BoxStream<'static, Result<JobStatusPayload, PushError>>;

/// Errors that can occur on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The subscription could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An established subscription broke.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Subscription to per-job status messages.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, job_id: &str) -> Result<PushStream, PushError>;
}

// ============================================================================
// WebSocket implementation
// ============================================================================

/// [`PushChannel`] over a WebSocket at `{ws_url}/ws?jobId={id}`.
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    ws_url: String,
}

impl WsPushChannel {
    /// * `ws_url` - WebSocket base URL, e.g. `wss://render.example.com`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// `{ws_url}/ws?jobId={job_id}` with the job id query-encoded.
    pub fn subscription_url(&self, job_id: &str) -> Result<Url, PushError> {
        let mut url = Url::parse(&format!("{}/ws", self.ws_url))
            .map_err(|e| PushError::Connection(format!("Invalid push URL {}: {e}", self.ws_url)))?;
        url.query_pairs_mut().append_pair("jobId", job_id);
        Ok(url)
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self, job_id: &str) -> Result<PushStream, PushError> {
        let url = self.subscription_url(job_id)?;
        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            PushError::Connection(format!("Failed to connect to {}: {e}", self.ws_url))
        })?;

        tracing::info!(job_id, "Push subscription opened");

        let job_id = job_id.to_string();
        let stream = futures::stream::unfold(Some(ws_stream), move |state| {
            let job_id = job_id.clone();
            async move {
                let mut ws = state?;
                loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => match parse_message(&text) {
                            Ok(PushMessage::JobStatus(payload)) => {
                                return Some((Ok(payload), Some(ws)));
                            }
                            Ok(PushMessage::Heartbeat) => {
                                tracing::trace!(job_id = %job_id, "Push heartbeat");
                            }
                            Err(e) => {
                                tracing::warn!(
                                    job_id = %job_id,
                                    error = %e,
                                    raw_message = %text,
                                    "Failed to parse push message",
                                );
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(job_id = %job_id, ?frame, "Push subscription closed by server");
                            return None;
                        }
                        // Binary frames carry nothing for us; ping/pong is
                        // answered by tungstenite.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(job_id = %job_id, error = %e, "Push receive error");
                            return Some((Err(PushError::Protocol(e.to_string())), None));
                        }
                        None => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

type Item = Result<JobStatusPayload, PushError>;

/// Test-side handle feeding one job's subscription.
#[derive(Debug, Clone)]
pub struct MockPushSender {
    tx: mpsc::UnboundedSender<Item>,
}

impl MockPushSender {
    /// Deliver a status payload. Returns `false` once the subscriber is gone.
    pub fn send(&self, payload: JobStatusPayload) -> bool {
        self.tx.send(Ok(payload)).is_ok()
    }

    /// Deliver a transport failure.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.send(Err(PushError::Protocol(message.into()))).is_ok()
    }

    /// Whether the subscriber dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// In-memory [`PushChannel`]. Jobs must be registered before they are
/// subscribed; subscribing to an unknown job fails like a refused
/// connection.
#[derive(Clone, Default)]
pub struct MockPushChannel {
    pending: Arc<Mutex<HashMap<String, mpsc::UnboundedReceiver<Item>>>>,
}

impl MockPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a subscription for `job_id` and return its feeding handle.
    /// Dropping every clone of the handle ends the stream.
    pub fn register(&self, job_id: &str) -> MockPushSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(job_id.to_string(), rx);
        MockPushSender { tx }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedReceiver<Item>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PushChannel for MockPushChannel {
    async fn subscribe(&self, job_id: &str) -> Result<PushStream, PushError> {
        let rx = self.lock().remove(job_id).ok_or_else(|| {
            PushError::Connection(format!("no push endpoint registered for job {job_id}"))
        })?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
