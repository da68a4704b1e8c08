//! The engine handle application code records through.
//!
//! An [`Engine`] is cheap to clone and every clone addresses the same
//! registry and scheduler. There is no process-wide instance; pass the handle
//! to the code that records. Dropping the last handle without calling
//! [`Engine::stop`] stops the scheduler as if [`StopMode::Forced`] had been
//! requested.
//!
//! Write methods are synchronous and never wait on the publisher. Errors they
//! encounter are logged and broadcast to [`Engine::errors`] subscribers;
//! [`Engine::try_record`] returns them instead.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    runtime::Handle,
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    error::{Error, Reporter},
    filter::FilterChain,
    identity::MetricId,
    instrument::{Instrument, Kind, Measurement},
    publisher::Publisher,
    query::QueryHandle,
    registry::Registry,
    scheduler::{Scheduler, StateMachine, TickReport},
    signal::{self, Broadcaster, StopMode},
    snapshot::Snapshot,
    tag::Tag,
};

#[derive(Debug)]
struct Inner {
    registry: Arc<Registry>,
    global_tags: Box<[Tag]>,
    reporter: Reporter,
    broadcaster: Broadcaster,
    stopped: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    ticks: watch::Receiver<Option<TickReport>>,
    runtime: Handle,
    shutdown: StopMode,
}

/// Handle to a running metrics engine. Construct with [`crate::Builder`].
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create the registry and spawn the scheduler on `runtime`.
    pub(crate) fn launch(
        runtime: Handle,
        config: &Config,
        global_tags: Vec<Tag>,
        filters: FilterChain,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.reservoir_size));
        let reporter = Reporter::new(config.error_channel_capacity);
        let (ticks_tx, ticks) = watch::channel(None);
        let scheduler = Scheduler::new(
            StateMachine::new(Arc::clone(&registry), filters),
            publisher,
            config.interval(),
            config.overrun,
            config.flush_on_shutdown,
            reporter.clone(),
            ticks_tx,
        );
        let (watcher, broadcaster) = signal::signal();
        let task = runtime.spawn(scheduler.run(watcher));
        info!(
            interval = ?config.interval(),
            global_tags = global_tags.len(),
            "Metrics engine started"
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                global_tags: global_tags.into_boxed_slice(),
                reporter,
                broadcaster,
                stopped: AtomicBool::new(false),
                scheduler: Mutex::new(Some(task)),
                ticks,
                runtime,
                shutdown: config.shutdown.into(),
            }),
        }
    }

    /// Whether [`Engine::stop`] has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether a stop has been requested. True while a graceful stop drains.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.broadcaster.is_signalled()
    }

    /// Number of registered instruments.
    #[must_use]
    pub fn instrument_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Zero every counter, timer, meter and histogram and start a new
    /// interval without publishing the discarded one. Gauges keep their
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] after [`Engine::stop`].
    pub fn reset_interval_instruments(&self) -> Result<(), Error> {
        self.ensure_running()?;
        self.inner.registry.reset_interval_instruments();
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::EngineStopped);
        }
        Ok(())
    }

    fn resolve(&self, name: &str, tags: &[Tag]) -> MetricId {
        let (id, rejected) = MetricId::resolve(name, &self.inner.global_tags, tags);
        for error in rejected {
            self.inner.reporter.report(error);
        }
        id
    }

    /// Look up or create the instrument for `name` and `tags`.
    pub(crate) fn instrument(&self, name: &str, kind: Kind, tags: &[Tag]) -> Result<Instrument, Error> {
        self.ensure_running()?;
        let id = self.resolve(name, tags);
        let created = self.inner.registry.get_or_create(&id, kind);
        self.unless_stopped(created)
    }

    /// A write that passed [`Engine::ensure_running`] just before `stop`
    /// cleared the registry may have recreated an instrument. Clear again and
    /// fail the write.
    fn unless_stopped<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if self.is_stopped() {
            self.inner.registry.clear();
            return Err(Error::EngineStopped);
        }
        result
    }

    pub(crate) fn report(&self, error: Error) {
        self.inner.reporter.report(error);
    }

    /// Record `measurement` against `name` and `tags`, returning any error
    /// rather than reporting it.
    ///
    /// Tags with an empty key are dropped and reported on the error channel;
    /// the measurement is still recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeConflict`] if the identity exists with another
    /// kind, [`Error::EngineStopped`] after [`Engine::stop`].
    pub fn try_record(&self, name: &str, measurement: Measurement, tags: &[Tag]) -> Result<(), Error> {
        self.ensure_running()?;
        let id = self.resolve(name, tags);
        let written = self.inner.registry.write(&id, measurement);
        self.unless_stopped(written)
    }

    fn record(&self, name: &str, measurement: Measurement, tags: &[Tag]) {
        if let Err(error) = self.try_record(name, measurement, tags) {
            self.inner.reporter.report(error);
        }
    }

    /// Set the gauge `name` to `value`.
    pub fn set_gauge_value(&self, name: &str, value: f64, tags: &[Tag]) {
        self.record(name, Measurement::Gauge(value), tags);
    }

    /// Add one to the counter `name`.
    pub fn increment_counter(&self, name: &str, tags: &[Tag]) {
        self.increment_counter_by(name, 1, tags);
    }

    /// Add `by` to the counter `name`. Negative values decrement.
    pub fn increment_counter_by(&self, name: &str, by: i64, tags: &[Tag]) {
        self.record(name, Measurement::Counter(by), tags);
    }

    /// Record one duration in the timer `name`.
    pub fn update_timer(&self, name: &str, duration: Duration, tags: &[Tag]) {
        self.record(name, Measurement::Timer(duration), tags);
    }

    /// Record the time elapsed since `start` in the timer `name`.
    pub fn update_timer_since(&self, name: &str, start: Instant, tags: &[Tag]) {
        self.update_timer(name, start.elapsed(), tags);
    }

    /// Run `f` and record how long it took in the timer `name`.
    pub fn time<T, F>(&self, name: &str, tags: &[Tag], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let out = f();
        self.update_timer_since(name, start, tags);
        out
    }

    /// Mark one event on the meter `name`.
    pub fn mark_meter(&self, name: &str, tags: &[Tag]) {
        self.mark_meter_times(name, 1, tags);
    }

    /// Mark `times` events on the meter `name`.
    pub fn mark_meter_times(&self, name: &str, times: u64, tags: &[Tag]) {
        self.record(name, Measurement::Meter(times), tags);
    }

    /// Record `value` in the histogram `name`.
    pub fn update_histogram(&self, name: &str, value: i64, tags: &[Tag]) {
        self.record(name, Measurement::Histogram(value), tags);
    }

    /// Sum the values of every instrument named `name`, grouped by the values
    /// of the tag `keys`. See [`crate::query`] for the grouping rules.
    ///
    /// The computation runs on the engine's runtime; the returned handle
    /// resolves to [`Error::EngineStopped`] at once if the engine is stopped.
    pub fn sum_query<S: AsRef<str>>(&self, name: &str, keys: &[S]) -> QueryHandle {
        if let Err(error) = self.ensure_running() {
            return QueryHandle::failed(error);
        }
        QueryHandle::spawn(
            &self.inner.runtime,
            Arc::clone(&self.inner.registry),
            name.to_owned(),
            keys.iter().map(|k| k.as_ref().to_owned()).collect(),
        )
    }

    /// Read every instrument without resetting anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] after [`Engine::stop`].
    pub fn snapshot(&self) -> Result<Snapshot, Error> {
        self.ensure_running()?;
        Ok(self.inner.registry.snapshot())
    }

    /// Subscribe to errors that could not be returned to a caller: failed
    /// writes, publish failures and abandoned intervals. Only errors reported
    /// after subscribing are received.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<Error> {
        self.inner.reporter.subscribe()
    }

    /// Watch the report of the most recently completed tick.
    #[must_use]
    pub fn ticks(&self) -> watch::Receiver<Option<TickReport>> {
        self.inner.ticks.clone()
    }

    /// Stop the scheduler and tear down the registry.
    ///
    /// Calling again while a graceful stop is draining with
    /// [`StopMode::Forced`] escalates it. Once stopped, further calls return
    /// at once.
    pub async fn stop(&self, mode: StopMode) {
        self.inner.broadcaster.signal(mode);
        let mut scheduler = self.inner.scheduler.lock().await;
        let Some(task) = scheduler.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Scheduler task did not exit cleanly");
        }
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.registry.clear();
        info!(?mode, "Metrics engine stopped");
    }

    /// Stop with the configured shutdown policy.
    pub async fn shutdown(&self) {
        self.stop(self.inner.shutdown).await;
    }
}
