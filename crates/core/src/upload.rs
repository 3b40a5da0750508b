//! Upload item model and pre-flight file policy.
//!
//! The upload coordinator in `atelier-render` owns and mutates these
//! items; this module only defines their shape and the checks that run
//! before a file is allowed to occupy an upload slot.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, ErrorKind};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default largest accepted file size (50 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// MIME prefixes accepted by default.
pub const DEFAULT_ALLOWED_MIME_PREFIXES: &[&str] = &["image/", "application/pdf", "text/"];

/// Fallback MIME type for unknown extensions.
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Item model
// ---------------------------------------------------------------------------

/// Stable identity of one file within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadItemId(pub Uuid);

impl UploadItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error recorded on a single upload item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<CoreError> for ItemError {
    fn from(err: CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// What the ingest endpoint returned for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestResult {
    pub processed: u32,
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Lifecycle of one upload item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Done { result: IngestResult },
    Error { error: ItemError },
}

impl UploadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// One file in a batch, as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: UploadItemId,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub status: UploadStatus,
    pub progress_pct: u8,
}

impl UploadItem {
    pub fn pending(id: UploadItemId, name: String, size_bytes: u64, mime_type: String) -> Self {
        Self {
            id,
            name,
            size_bytes,
            mime_type,
            status: UploadStatus::Pending,
            progress_pct: 0,
        }
    }

    /// Raise progress to `pct` (clamped to 100). Returns `true` when the
    /// stored value changed; progress never goes backwards.
    pub fn raise_progress(&mut self, pct: u8) -> bool {
        let pct = pct.min(100);
        if pct > self.progress_pct {
            self.progress_pct = pct;
            true
        } else {
            false
        }
    }

    pub fn mark_uploading(&mut self) {
        self.status = UploadStatus::Uploading;
    }

    pub fn mark_done(&mut self, result: IngestResult) {
        self.progress_pct = 100;
        self.status = UploadStatus::Done { result };
    }

    pub fn mark_error(&mut self, error: ItemError) {
        self.status = UploadStatus::Error { error };
    }
}

/// Percentage of `total` represented by `sent`, rounded down.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) as f64 / total as f64) * 100.0) as u8
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Size/type rules a file must satisfy before it may be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_file_bytes: u64,
    /// Accepted MIME types. An entry ending in `/` matches every subtype.
    pub allowed_mime_prefixes: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allowed_mime_prefixes: DEFAULT_ALLOWED_MIME_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UploadPolicy {
    /// Check a file against the policy.
    pub fn check(&self, name: &str, size_bytes: u64, mime_type: &str) -> Result<(), CoreError> {
        if size_bytes == 0 {
            return Err(CoreError::Validation(format!("File '{name}' is empty")));
        }
        if size_bytes > self.max_file_bytes {
            return Err(CoreError::Validation(format!(
                "File '{name}' is {size_bytes} bytes, exceeding the limit of {} bytes",
                self.max_file_bytes
            )));
        }

        let mime = mime_type.to_ascii_lowercase();
        let allowed = self.allowed_mime_prefixes.iter().any(|prefix| {
            if prefix.ends_with('/') {
                mime.starts_with(prefix.as_str())
            } else {
                mime == *prefix
            }
        });
        if !allowed {
            return Err(CoreError::Validation(format!(
                "File '{name}' has unsupported type '{mime_type}'"
            )));
        }
        Ok(())
    }
}

/// Guess a MIME type from a file name's extension.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => MIME_OCTET_STREAM,
    }
}
