//! Domain types and pure logic for the Atelier render client.
//!
//! Nothing in this crate performs I/O. The networked pieces (resilient
//! HTTP client, push channel, job tracker, upload coordinator) live in
//! `atelier-render` and build on the types defined here:
//!
//! - [`error`]: the error taxonomy shared by every layer.
//! - [`generation`]: generation request validation and normalization.
//! - [`job`]: job state, sequence-numbered updates, and reconciliation.
//! - [`upload`]: upload item model and the pre-flight file policy.
//! - [`variants`]: per-variant slot view derived from a job state.

pub mod error;
pub mod generation;
pub mod job;
pub mod types;
pub mod upload;
pub mod variants;

pub use error::{CoreError, ErrorKind};
