//! Stop signalling between an [`crate::Engine`] handle and its scheduler.
//!
//! There is one `Broadcaster`, owned by the engine, and one `Watcher`, owned
//! by the scheduler task. The signal is a one-time event carrying the
//! [`StopMode`] the scheduler must honor. Signalling twice keeps the first
//! mode unless the second is [`StopMode::Forced`], which always wins: a
//! caller may escalate a graceful stop that is taking too long.

use std::time::Duration;

use tokio::sync::watch;

/// How the scheduler treats an in-flight interval when stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Wait up to `timeout` for the in-flight publish, then publish the
    /// partial final interval if so configured, under the same bound.
    Graceful {
        /// Upper bound on time spent draining
        timeout: Duration,
    },
    /// Drop the in-flight publish immediately and report it abandoned.
    Forced,
}

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub(crate) fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(None);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify the scheduler that it must stop.
pub(crate) struct Broadcaster {
    sender: watch::Sender<Option<StopMode>>,
}

impl Broadcaster {
    /// Send the stop signal. Returns false if a stop was already signalled,
    /// in which case only an escalation to `Forced` takes effect.
    pub(crate) fn signal(&self, mode: StopMode) -> bool {
        let mut first = false;
        self.sender.send_if_modified(|current| match (*current, mode) {
            (None, _) => {
                *current = Some(mode);
                first = true;
                true
            }
            (Some(StopMode::Graceful { .. }), StopMode::Forced) => {
                *current = Some(StopMode::Forced);
                true
            }
            (Some(_), _) => false,
        });
        first
    }

    /// Whether a stop has been signalled.
    pub(crate) fn is_signalled(&self) -> bool {
        self.sender.borrow().is_some()
    }
}

#[derive(Debug)]
/// Mechanism to watch for the stop signal.
pub(crate) struct Watcher {
    receiver: watch::Receiver<Option<StopMode>>,
}

impl Watcher {
    /// Wait for the stop signal. Returns immediately, repeatedly, once the
    /// signal has been sent. A dropped `Broadcaster` reads as `Forced`.
    ///
    /// Cancel safe.
    pub(crate) async fn recv(&mut self) -> StopMode {
        loop {
            let current = *self.receiver.borrow_and_update();
            if let Some(mode) = current {
                return mode;
            }
            if self.receiver.changed().await.is_err() {
                return StopMode::Forced;
            }
        }
    }

    /// Wait until the signalled mode is `Forced`. Used while draining a
    /// graceful stop so the caller can escalate. Cancel safe.
    pub(crate) async fn forced(&mut self) {
        loop {
            let current = *self.receiver.borrow_and_update();
            if current == Some(StopMode::Forced) {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Check for the stop signal without waiting.
    #[cfg(test)]
    pub(crate) fn try_recv(&self) -> Option<StopMode> {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_returns_signalled_mode() {
        let (mut watcher, broadcaster) = signal();
        assert_eq!(watcher.try_recv(), None);
        assert!(broadcaster.signal(StopMode::Graceful {
            timeout: Duration::from_secs(1)
        }));
        assert_eq!(
            watcher.recv().await,
            StopMode::Graceful {
                timeout: Duration::from_secs(1)
            }
        );
        // repeated recv does not block
        assert!(matches!(watcher.recv().await, StopMode::Graceful { .. }));
    }

    #[tokio::test]
    async fn forced_escalates_graceful_but_not_the_reverse() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal(StopMode::Graceful {
            timeout: Duration::from_secs(1),
        });
        assert!(!broadcaster.signal(StopMode::Forced));
        assert_eq!(watcher.try_recv(), Some(StopMode::Forced));
        assert!(!broadcaster.signal(StopMode::Graceful {
            timeout: Duration::from_secs(5)
        }));
        assert_eq!(watcher.try_recv(), Some(StopMode::Forced));
        assert!(broadcaster.is_signalled());
    }

    #[tokio::test]
    async fn forced_resolves_only_on_escalation() {
        let (mut watcher, broadcaster) = signal();
        broadcaster.signal(StopMode::Graceful {
            timeout: Duration::from_secs(1),
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), watcher.forced())
                .await
                .is_err()
        );
        broadcaster.signal(StopMode::Forced);
        watcher.forced().await;
    }

    #[tokio::test]
    async fn dropped_broadcaster_reads_as_forced() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);
        assert_eq!(watcher.recv().await, StopMode::Forced);
    }

    #[tokio::test]
    async fn recv_wakes_on_signal_from_another_task() {
        let (mut watcher, broadcaster) = signal();
        let waiter = tokio::spawn(async move { watcher.recv().await });
        tokio::task::yield_now().await;
        broadcaster.signal(StopMode::Forced);
        assert_eq!(waiter.await.unwrap(), StopMode::Forced);
    }
}
