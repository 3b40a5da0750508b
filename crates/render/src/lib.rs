//! Networked half of the Atelier render client.
//!
//! Provides the resilient HTTP layer (timeouts, retries with backoff, a
//! circuit breaker), a typed render API, the push channel, dual-channel
//! job tracking, batch uploads and the submission facade used by the UI.

pub mod api;
pub mod backoff;
pub mod breaker;
pub mod config;
pub mod facade;
pub mod http;
pub mod messages;
pub mod push;
pub mod resilient;
pub mod tracker;
pub mod upload;

pub use api::{ApiError, RenderApi};
pub use config::{ClientConfig, ConfigError, RenderClients};
pub use facade::{JobSubmitter, SubmitMode, Submission, TrackedJob};
pub use resilient::{RequestError, ResilientClient};
pub use tracker::{JobHandle, JobTracker, TrackerConfig};
pub use upload::{UploadBatch, UploadCoordinator, UploadFile, UploadSummary};
