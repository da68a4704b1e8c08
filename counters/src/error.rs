//! Errors produced by the engine and the channel they are reported through.
//!
//! Writes are fire-and-forget: a failing write never returns an error to the
//! call site of `Engine::increment_counter` and friends. Instead the error is
//! logged and broadcast to every subscriber obtained from `Engine::errors`.
//! Callers that want the error synchronously use `Engine::try_record`.

use tokio::sync::broadcast;
use tracing::warn;

use crate::instrument::Kind;

/// Errors produced by [`crate::Engine`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A metric identity was first registered as one kind and later written
    /// as another. The existing instrument is left untouched.
    #[error("metric {name} is registered as a {existing}, refusing write as {requested}")]
    TypeConflict {
        /// Rendered identity of the conflicting metric
        name: String,
        /// Kind of the instrument already in the registry
        existing: Kind,
        /// Kind the rejected write asked for
        requested: Kind,
    },
    /// The publisher returned an error for an interval.
    #[error("publish of interval {interval} failed: {reason}")]
    PublishFailure {
        /// Index of the interval that failed to publish
        interval: u64,
        /// Rendered publisher error
        reason: String,
    },
    /// An in-flight publish was dropped by a forced stop or a graceful stop
    /// that ran out of time.
    #[error("publish of interval {interval} abandoned during shutdown")]
    Abandoned {
        /// Index of the interval whose publish never completed
        interval: u64,
    },
    /// The engine has been stopped.
    #[error("engine is stopped")]
    EngineStopped,
    /// A tag was given an empty key. The tag is dropped, the measurement is
    /// still recorded.
    #[error("tag with empty key (value {value:?}) rejected")]
    InvalidTag {
        /// Value of the rejected tag
        value: String,
    },
    /// A query task was cancelled before it produced a result.
    #[error("query cancelled")]
    QueryCancelled,
    /// A query task panicked.
    #[error("query failed: {0}")]
    QueryFailed(String),
    /// The engine was built outside of a tokio runtime.
    #[error("no tokio runtime available to run the engine")]
    NoRuntime,
    /// The builder was given a configuration it cannot run with.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Rendered configuration error
        reason: String,
    },
    /// A global `metrics` recorder was already installed.
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// Fan-out point for errors that cannot be returned to a caller.
///
/// Sending never blocks. A subscriber that falls behind by more than the
/// channel capacity loses the oldest errors.
#[derive(Debug, Clone)]
pub(crate) struct Reporter {
    sender: broadcast::Sender<Error>,
}

impl Reporter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn report(&self, error: Error) {
        warn!(%error, "metrics engine error");
        // No subscribers is not an error, the warn! above is the record.
        let _ = self.sender.send(error);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Error> {
        self.sender.subscribe()
    }
}
