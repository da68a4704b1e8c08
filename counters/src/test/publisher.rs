//! In-memory publisher for testing
//!
//! Records every batch it is handed and can be told to fail, hang or be slow.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    publisher::{PublishError, Publisher},
    snapshot::FilterResult,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    Succeed,
    Fail,
    Hang,
    Sleep(Duration),
}

/// Cloning shares the recorded state.
#[derive(Debug, Clone)]
pub(crate) struct RecordingPublisher {
    behavior: Arc<Mutex<Behavior>>,
    batches: Arc<Mutex<Vec<FilterResult>>>,
    calls: Arc<AtomicUsize>,
    called: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Counts a publish as in flight until dropped, whether it completes, fails
/// or is cancelled.
struct InFlight<'a> {
    publisher: &'a RecordingPublisher,
}

impl<'a> InFlight<'a> {
    fn enter(publisher: &'a RecordingPublisher) -> Self {
        let now = publisher.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        publisher.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { publisher }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.publisher.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingPublisher {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            batches: Arc::default(),
            calls: Arc::default(),
            called: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().expect("mutex poisoned") = behavior;
    }

    /// Batches whose publish completed successfully.
    pub(crate) fn batches(&self) -> Vec<FilterResult> {
        self.batches.lock().expect("mutex poisoned").clone()
    }

    /// Number of times `publish` was entered.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most publishes ever in flight at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until `publish` has been entered at least `n` times.
    pub(crate) async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            if self.calls() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, batch: &FilterResult) -> Result<(), PublishError> {
        let _guard = InFlight::enter(self);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.called.notify_waiters();
        let behavior = *self.behavior.lock().expect("mutex poisoned");
        match behavior {
            Behavior::Succeed => {}
            Behavior::Fail => return Err(PublishError::Backend("backend down".into())),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Sleep(d) => tokio::time::sleep(d).await,
        }
        self.batches
            .lock()
            .expect("mutex poisoned")
            .push(batch.clone());
        Ok(())
    }
}
