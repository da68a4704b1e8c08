//! The boundary between the engine and a reporting backend.
//!
//! The scheduler calls [`Publisher::publish`] once per interval with a
//! non-empty [`FilterResult`]. A publisher owns its own I/O, retries and
//! protocol. An error returned from `publish` is logged and reported on the
//! engine's error channel; it never stops the scheduler.

use async_trait::async_trait;

use crate::snapshot::FilterResult;

pub mod jsonl;

/// Errors a [`Publisher`] may return.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// IO errors during write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
/// Receives filtered snapshots at the end of each interval.
pub trait Publisher: Send + Sync {
    /// Deliver `batch` to the backend.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the batch could not be
    /// delivered. The engine does not retry.
    async fn publish(&self, batch: &FilterResult) -> Result<(), PublishError>;
}

/// A publisher that discards everything, used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

#[async_trait]
impl Publisher for Discard {
    async fn publish(&self, _batch: &FilterResult) -> Result<(), PublishError> {
        Ok(())
    }
}
