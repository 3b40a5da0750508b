//! One-exchange HTTP transport. Retries and circuit breaking live in
//! [`crate::resilient`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
pub use reqwest::Method;

/// Size of each streamed chunk of a multipart file body.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Callback receiving `(bytes_sent, bytes_total)` while a file body is
/// streamed.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A file attached to a multipart request.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name, e.g. `file`.
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

/// Transport-agnostic description of one HTTP request.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the service base URL, starting with `/`.
    pub path: String,
    pub body: RequestBody,
    /// Invoked while a multipart file body is being sent.
    pub progress: Option<ProgressFn>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: RequestBody::Empty,
            progress: None,
        }
    }

    pub fn post_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Json(body),
            progress: None,
        }
    }

    pub fn post_multipart(
        path: impl Into<String>,
        fields: Vec<(String, String)>,
        file: FilePart,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Multipart { fields, file },
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// `"{METHOD} {path}"`, used as a log label and as the mock lookup key.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("body", &self.body)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Buffered response of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The exchange could not be completed at the network level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Executes a single HTTP exchange.
///
/// Implementations must not retry; a dropped future must abort the
/// underlying request.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// [`HttpClient`] backed by a pooled [`reqwest::Client`].
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ReqwestHttpClient {
    /// * `base_url` - service root, e.g. `https://render.example.com`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart { fields, file } => {
                builder.multipart(build_form(fields, file, request.progress.clone())?)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, bytes = body.len(), "HTTP exchange finished");
        Ok(HttpResponse { status, body })
    }
}

fn build_form(
    fields: &[(String, String)],
    file: &FilePart,
    progress: Option<ProgressFn>,
) -> Result<reqwest::multipart::Form, TransportError> {
    let mut form = reqwest::multipart::Form::new();
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }

    let total = file.data.len() as u64;
    let body = reqwest::Body::wrap_stream(chunked_body(Arc::clone(&file.data), progress));
    let part = reqwest::multipart::Part::stream_with_length(body, total)
        .file_name(file.file_name.clone())
        .mime_str(&file.mime_type)?;

    Ok(form.part(file.field.clone(), part))
}

/// Stream `data` in fixed-size chunks, reporting progress as each chunk
/// is handed to the transport.
fn chunked_body(
    data: Arc<Vec<u8>>,
    progress: Option<ProgressFn>,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    let total = data.len() as u64;
    let offsets: Vec<usize> = (0..data.len()).step_by(UPLOAD_CHUNK_BYTES).collect();
    futures::stream::iter(offsets.into_iter().map(move |start| {
        let end = (start + UPLOAD_CHUNK_BYTES).min(data.len());
        if let Some(report) = &progress {
            report(end as u64, total);
        }
        Ok(data[start..end].to_vec())
    }))
}

// ============================================================================
// Mock implementation
// ============================================================================

/// Scripted outcome of one mocked exchange.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub delay: Duration,
    pub outcome: Result<HttpResponse, String>,
}

impl MockReply {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(HttpResponse {
                status,
                body: body.into(),
            }),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::status(status, body.to_string())
    }

    /// A network-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(message.into()),
        }
    }

    /// Complete only after `delay` (tokio time, so paused clocks apply).
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Record of a call made to the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: Method,
    pub path: String,
    pub json: Option<serde_json::Value>,
    pub fields: Vec<(String, String)>,
    pub file_name: Option<String>,
    pub at: tokio::time::Instant,
}

type Responder = Arc<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

/// Scriptable [`HttpClient`] for tests. Queued replies keyed by
/// `"{METHOD} {path}"` win over the responder; with neither, the call
/// fails with a transport error.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    queues: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    responder: Arc<Mutex<Option<Responder>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `key` (`"POST /render"`). Replies for the same
    /// key are returned in FIFO order.
    pub fn add_reply(&self, key: &str, reply: MockReply) {
        lock(&self.queues)
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Answer every request that has no queued reply.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Arc::new(responder));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of exchanges that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &HttpRequest) -> MockReply {
        let key = request.key();
        if let Some(reply) = lock(&self.queues).get_mut(&key).and_then(VecDeque::pop_front) {
            return reply;
        }
        let responder = lock(&self.responder).clone();
        match responder {
            Some(responder) => responder(request),
            None => MockReply::transport(format!("no mock reply for {key}")),
        }
    }
}

/// Decrements the in-flight counter even when the exchange is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));

        let (json, fields, file) = match &request.body {
            RequestBody::Empty => (None, Vec::new(), None),
            RequestBody::Json(value) => (Some(value.clone()), Vec::new(), None),
            RequestBody::Multipart { fields, file } => (None, fields.clone(), Some(file.clone())),
        };
        lock(&self.calls).push(MockCall {
            method: request.method.clone(),
            path: request.path.clone(),
            json,
            fields,
            file_name: file.as_ref().map(|f| f.file_name.clone()),
            at: tokio::time::Instant::now(),
        });

        let reply = self.next_reply(request);
        let total = file.as_ref().map(|f| f.data.len() as u64).unwrap_or(0);

        if let (Some(report), Some(_)) = (&request.progress, &file) {
            report(total / 2, total);
        }
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        match reply.outcome {
            Ok(response) => {
                if let (Some(report), Some(_)) = (&request.progress, &file) {
                    report(total, total);
                }
                Ok(response)
            }
            Err(message) => Err(TransportError::Other(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn mock_returns_queued_replies_in_order() {
        let mock = MockHttpClient::new();
        mock.add_reply("GET /a", MockReply::status(200, "first"));
        mock.add_reply("GET /a", MockReply::status(503, "second"));

        let first = mock.execute(&HttpRequest::get("/a")).await.unwrap();
        let second = mock.execute(&HttpRequest::get("/a")).await.unwrap();
        assert_eq!(first.body, "first");
        assert_eq!(second.status, 503);
        assert!(mock.execute(&HttpRequest::get("/a")).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn mock_falls_back_to_responder() {
        let mock = MockHttpClient::new();
        mock.set_responder(|req| MockReply::status(200, req.path.clone()));

        let response = mock.execute(&HttpRequest::get("/echo")).await.unwrap();
        assert_eq!(response.body, "/echo");
    }

    #[tokio::test]
    async fn mock_reports_multipart_progress() {
        let mock = MockHttpClient::new();
        mock.add_reply("POST /ingest/file", MockReply::status(200, "{}"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let request = HttpRequest::post_multipart(
            "/ingest/file",
            vec![("project_id".into(), "p1".into())],
            FilePart {
                field: "file".into(),
                file_name: "logo.png".into(),
                mime_type: "image/png".into(),
                data: Arc::new(vec![0u8; 10]),
            },
        )
        .with_progress(Arc::new(move |sent: u64, total: u64| {
            lock(&sink).push((sent, total));
        }));

        mock.execute(&request).await.unwrap();
        assert_eq!(*lock(&seen), vec![(5, 10), (10, 10)]);
        assert_eq!(mock.calls()[0].file_name.as_deref(), Some("logo.png"));
    }

    #[tokio::test]
    async fn chunked_body_reports_cumulative_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let data = Arc::new(vec![1u8; UPLOAD_CHUNK_BYTES * 2 + 10]);
        let total = data.len() as u64;

        let chunks: Vec<_> = chunked_body(
            data,
            Some(Arc::new(move |sent: u64, total: u64| {
                lock(&sink).push((sent, total))
            })),
        )
        .collect()
        .await;

        assert_eq!(chunks.len(), 3);
        let reported = lock(&seen).clone();
        assert_eq!(reported.last(), Some(&(total, total)));
        assert_eq!(reported[0].0, UPLOAD_CHUNK_BYTES as u64);
    }

    #[test]
    fn request_key_combines_method_and_path() {
        assert_eq!(HttpRequest::get("/render/jobs/7").key(), "GET /render/jobs/7");
    }
}
