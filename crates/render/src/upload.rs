//! Batch file upload with bounded concurrency.
//!
//! [`UploadCoordinator::upload`] returns an [`UploadBatch`]: a stream of
//! item snapshots, emitted every time an item changes. Nothing is sent
//! until the stream is polled. Items that fail the [`UploadPolicy`] are
//! marked as errors up front and never occupy an upload slot; the rest
//! start in queue order as slots free up. One item's failure never
//! affects another.

use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use atelier_core::upload::{
    guess_mime_type, progress_percent, IngestResult, ItemError, UploadItem, UploadItemId,
    UploadPolicy, UploadStatus,
};
use atelier_core::CoreError;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, RenderApi, INGEST_FILE_FIELD};
use crate::http::{FilePart, ProgressFn};

/// Default number of uploads in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// A file selected for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub data: Arc<Vec<u8>>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: Arc::new(data),
        }
    }

    /// Build from memory, guessing the MIME type from the file name.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name).to_string();
        Self::new(name, mime_type, data)
    }

    /// Read a file from disk, guessing the MIME type from its extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::from_bytes(name, data))
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Error of one item, named by its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub file_name: String,
    pub error: ItemError,
}

/// Aggregate result of a batch. Individual failures are listed, never
/// raised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadSummary {
    pub success_count: usize,
    pub errors: Vec<FileError>,
    /// Final state of every item still in the batch, in selection order.
    pub items: Vec<UploadItem>,
    /// Items removed by the caller.
    pub removed: Vec<UploadItemId>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Uploads batches of files through the render API's ingest endpoint.
#[derive(Clone)]
pub struct UploadCoordinator {
    api: RenderApi,
    policy: UploadPolicy,
    max_concurrency: usize,
}

impl UploadCoordinator {
    pub fn new(api: RenderApi, policy: UploadPolicy, max_concurrency: usize) -> Self {
        Self {
            api,
            policy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Prepare a batch. Uploading starts when the returned stream is
    /// first polled.
    pub fn upload(&self, files: Vec<UploadFile>, project_id: &str) -> UploadBatch {
        let mut items = Vec::with_capacity(files.len());
        let mut queue = VecDeque::new();
        let mut outbox = VecDeque::new();

        for file in files {
            let mut item = UploadItem::pending(
                UploadItemId::new(),
                file.name.clone(),
                file.size_bytes(),
                file.mime_type.clone(),
            );
            match self.policy.check(&file.name, file.size_bytes(), &file.mime_type) {
                Ok(()) => queue.push_back((item.id, file)),
                Err(e) => {
                    tracing::warn!(item_id = %item.id, file = %file.name, error = %e, "File rejected before upload");
                    item.mark_error(ItemError::from(e));
                }
            }
            outbox.push_back(item.clone());
            items.push(item);
        }

        tracing::info!(
            total = items.len(),
            queued = queue.len(),
            max_concurrency = self.max_concurrency,
            "Upload batch prepared",
        );

        let ledger = Arc::new(Mutex::new(Ledger {
            items,
            removed: Vec::new(),
        }));
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            api: self.api.clone(),
            project_id: project_id.to_string(),
            max_concurrency: self.max_concurrency,
            queue,
            in_flight: FuturesUnordered::new(),
            tokens: Vec::new(),
            outbox,
            ledger: Arc::clone(&ledger),
            progress_tx,
            progress_rx,
            remove_rx,
        };

        let updates = futures::stream::unfold(driver, |mut driver| async move {
            driver.next_update().await.map(|item| (item, driver))
        })
        .boxed();

        UploadBatch {
            updates,
            remove_tx,
            ledger,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A running upload batch. Yields a snapshot of an item each time it
/// changes; ends once every item is finished or removed.
pub struct UploadBatch {
    updates: BoxStream<'static, UploadItem>,
    remove_tx: mpsc::UnboundedSender<UploadItemId>,
    ledger: Arc<Mutex<Ledger>>,
}

impl UploadBatch {
    /// Remove an item. A queued item is dropped from the queue; an item
    /// being uploaded has its request aborted. Takes effect the next time
    /// the stream is polled.
    pub fn remove(&self, id: UploadItemId) {
        if self.remove_tx.send(id).is_err() {
            // The batch already finished; only the ledger is left.
            lock(&self.ledger).remove(id);
        }
    }

    /// Current state of every item, in selection order.
    pub fn items(&self) -> Vec<UploadItem> {
        lock(&self.ledger).items.clone()
    }

    /// Drive the batch to completion and summarize it.
    pub async fn finish(mut self) -> UploadSummary {
        while self.updates.next().await.is_some() {}
        lock(&self.ledger).summary()
    }
}

impl Stream for UploadBatch {
    type Item = UploadItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_next_unpin(cx)
    }
}

struct Ledger {
    items: Vec<UploadItem>,
    removed: Vec<UploadItemId>,
}

impl Ledger {
    fn update<F>(&mut self, id: UploadItemId, f: F) -> Option<UploadItem>
    where
        F: FnOnce(&mut UploadItem) -> bool,
    {
        let item = self.items.iter_mut().find(|i| i.id == id)?;
        if f(item) {
            Some(item.clone())
        } else {
            None
        }
    }

    fn remove(&mut self, id: UploadItemId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() < before {
            self.removed.push(id);
            true
        } else {
            false
        }
    }

    fn summary(&self) -> UploadSummary {
        let mut summary = UploadSummary {
            items: self.items.clone(),
            removed: self.removed.clone(),
            ..Default::default()
        };
        for item in &self.items {
            match &item.status {
                UploadStatus::Done { .. } => summary.success_count += 1,
                UploadStatus::Error { error } => summary.errors.push(FileError {
                    file_name: item.name.clone(),
                    error: error.clone(),
                }),
                UploadStatus::Pending | UploadStatus::Uploading => {}
            }
        }
        summary
    }
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Outcome of one upload future; `None` when it was aborted by removal.
type Finished = (UploadItemId, Option<Result<IngestResult, ApiError>>);

struct Driver {
    api: RenderApi,
    project_id: String,
    max_concurrency: usize,
    queue: VecDeque<(UploadItemId, UploadFile)>,
    in_flight: FuturesUnordered<BoxFuture<'static, Finished>>,
    tokens: Vec<(UploadItemId, CancellationToken)>,
    outbox: VecDeque<UploadItem>,
    ledger: Arc<Mutex<Ledger>>,
    progress_tx: mpsc::UnboundedSender<(UploadItemId, u8)>,
    progress_rx: mpsc::UnboundedReceiver<(UploadItemId, u8)>,
    remove_rx: mpsc::UnboundedReceiver<UploadItemId>,
}

impl Driver {
    async fn next_update(&mut self) -> Option<UploadItem> {
        loop {
            if let Some(item) = self.outbox.pop_front() {
                return Some(item);
            }

            self.fill_slots();
            if !self.outbox.is_empty() {
                continue;
            }
            if self.queue.is_empty() && self.in_flight.is_empty() {
                while let Ok(id) = self.remove_rx.try_recv() {
                    self.remove(id);
                }
                return None;
            }

            tokio::select! {
                biased;

                Some(id) = self.remove_rx.recv() => self.remove(id),

                Some((id, pct)) = self.progress_rx.recv() => {
                    let snapshot = lock(&self.ledger).update(id, |item| {
                        item.status == UploadStatus::Uploading && item.raise_progress(pct)
                    });
                    self.outbox.extend(snapshot);
                }

                Some((id, outcome)) = self.in_flight.next() => {
                    self.tokens.retain(|(token_id, _)| *token_id != id);
                    if let Some(result) = outcome {
                        self.finish_item(id, result);
                    }
                }
            }
        }
    }

    /// Start queued items while slots are free.
    fn fill_slots(&mut self) {
        while self.in_flight.len() < self.max_concurrency {
            let Some((id, file)) = self.queue.pop_front() else {
                break;
            };
            let snapshot = lock(&self.ledger).update(id, |item| {
                item.mark_uploading();
                true
            });
            tracing::debug!(item_id = %id, file = %file.name, "Upload started");
            self.outbox.extend(snapshot);
            let upload = self.start_upload(id, file);
            self.in_flight.push(upload);
        }
    }

    fn start_upload(&mut self, id: UploadItemId, file: UploadFile) -> BoxFuture<'static, Finished> {
        let token = CancellationToken::new();
        self.tokens.push((id, token.clone()));

        let progress_tx = self.progress_tx.clone();
        let progress: ProgressFn = Arc::new(move |sent: u64, total: u64| {
            let _ = progress_tx.send((id, progress_percent(sent, total)));
        });
        let part = FilePart {
            field: INGEST_FILE_FIELD.to_string(),
            file_name: file.name,
            mime_type: file.mime_type,
            data: file.data,
        };
        let api = self.api.clone();
        let project_id = self.project_id.clone();

        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => (id, None),
                result = api.ingest_file(&project_id, part, Some(progress)) => (id, Some(result)),
            }
        }
        .boxed()
    }

    fn finish_item(&mut self, id: UploadItemId, result: Result<IngestResult, ApiError>) {
        let snapshot = match result {
            Ok(ingested) => {
                tracing::info!(item_id = %id, processed = ingested.processed, "Upload finished");
                lock(&self.ledger).update(id, |item| {
                    item.mark_done(ingested);
                    true
                })
            }
            Err(e) => {
                tracing::warn!(item_id = %id, error = %e, "Upload failed");
                let error = ItemError::from(CoreError::from(e));
                lock(&self.ledger).update(id, |item| {
                    item.mark_error(error);
                    true
                })
            }
        };
        self.outbox.extend(snapshot);
    }

    fn remove(&mut self, id: UploadItemId) {
        self.queue.retain(|(queued, _)| *queued != id);
        if let Some(pos) = self.tokens.iter().position(|(token_id, _)| *token_id == id) {
            let (_, token) = self.tokens.remove(pos);
            token.cancel();
        }
        self.outbox.retain(|item| item.id != id);

        if lock(&self.ledger).remove(id) {
            tracing::info!(item_id = %id, "Upload item removed");
        }
    }
}
