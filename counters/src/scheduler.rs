//! The interval loop: take the interval, filter, publish.
//!
//! Following the capture manager's split, [`StateMachine`] holds the tick
//! logic without async encumbrance and [`Scheduler::run`] owns the tokio
//! select loop, timing and shutdown. Ticks never overlap: the loop awaits the
//! publisher before it polls the interval timer again.
//!
//! A tick reads and resets the registry in one step per instrument before
//! the publisher is called. Writes that land while a publish is in flight
//! belong to the next interval.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::OverrunPolicy,
    error::{Error, Reporter},
    filter::FilterChain,
    publisher::{PublishError, Publisher},
    registry::Registry,
    signal::{StopMode, Watcher},
    snapshot::FilterResult,
};

/// Where the scheduler is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the next tick
    Idle,
    /// Snapshot taken, publish in flight
    Running,
    /// Last tick published successfully
    Published,
    /// Last tick had nothing left after filtering, publish skipped
    SkippedEmpty,
    /// Last tick's publish failed or was abandoned
    Failed,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Published this many entries
    Published {
        /// Entries handed to the publisher
        entries: usize,
    },
    /// Nothing survived the filter chain
    SkippedEmpty,
    /// The publisher returned an error
    Failed,
    /// The publish was dropped during shutdown
    Abandoned,
}

/// Report of the most recently completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Index of the interval the tick closed
    pub interval: u64,
    /// What happened
    pub outcome: TickOutcome,
    /// Total ticks completed by this scheduler, including this one
    pub completed: u64,
}

/// Tick logic, free of timing and I/O.
#[derive(Debug)]
pub(crate) struct StateMachine {
    registry: Arc<Registry>,
    filters: FilterChain,
    phase: Phase,
    completed: u64,
}

impl StateMachine {
    pub(crate) fn new(registry: Arc<Registry>, filters: FilterChain) -> Self {
        Self {
            registry,
            filters,
            phase: Phase::Idle,
            completed: 0,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Close the current interval. Returns the batch to publish, or the
    /// report of a skipped tick if the filter chain left nothing.
    pub(crate) fn begin(&mut self) -> Result<FilterResult, TickReport> {
        debug_assert_ne!(self.phase, Phase::Running, "ticks must not overlap");
        self.phase = Phase::Running;
        let snapshot = self.registry.take_interval();
        let captured = snapshot.entries().len();
        let batch = self.filters.apply(snapshot);
        debug!(
            interval = batch.interval(),
            captured,
            kept = batch.len(),
            "Closed interval"
        );
        if batch.is_empty() {
            return Err(self.complete(batch.interval(), TickOutcome::SkippedEmpty));
        }
        Ok(batch)
    }

    /// Record the end of the tick begun by [`StateMachine::begin`].
    pub(crate) fn complete(&mut self, interval: u64, outcome: TickOutcome) -> TickReport {
        self.phase = match outcome {
            TickOutcome::Published { .. } => Phase::Published,
            TickOutcome::SkippedEmpty => Phase::SkippedEmpty,
            TickOutcome::Failed | TickOutcome::Abandoned => Phase::Failed,
        };
        self.completed += 1;
        TickReport {
            interval,
            outcome,
            completed: self.completed,
        }
    }

    pub(crate) fn idle(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// Async driver around [`StateMachine`].
pub(crate) struct Scheduler {
    machine: StateMachine,
    publisher: Arc<dyn Publisher>,
    period: Duration,
    overrun: OverrunPolicy,
    flush_on_shutdown: bool,
    reporter: Reporter,
    ticks: watch::Sender<Option<TickReport>>,
}

impl Scheduler {
    pub(crate) fn new(
        machine: StateMachine,
        publisher: Arc<dyn Publisher>,
        period: Duration,
        overrun: OverrunPolicy,
        flush_on_shutdown: bool,
        reporter: Reporter,
        ticks: watch::Sender<Option<TickReport>>,
    ) -> Self {
        Self {
            machine,
            publisher,
            period,
            overrun,
            flush_on_shutdown,
            reporter,
            ticks,
        }
    }

    fn finish(&mut self, interval: u64, result: Result<(), PublishError>, entries: usize) {
        let outcome = match result {
            Ok(()) => TickOutcome::Published { entries },
            Err(e) => {
                self.reporter.report(Error::PublishFailure {
                    interval,
                    reason: e.to_string(),
                });
                TickOutcome::Failed
            }
        };
        let report = self.machine.complete(interval, outcome);
        self.report(report);
    }

    fn abandon(&mut self, interval: u64) {
        self.reporter.report(Error::Abandoned { interval });
        let report = self.machine.complete(interval, TickOutcome::Abandoned);
        self.report(report);
    }

    fn report(&mut self, report: TickReport) {
        debug!(
            interval = report.interval,
            phase = ?self.machine.phase(),
            completed = report.completed,
            "Tick complete"
        );
        self.machine.idle();
        self.ticks.send_replace(Some(report));
    }

    /// Warn if the tick begun at `started` ran past its period. Under
    /// [`OverrunPolicy::Skip`] the timer is moved to the first cadence point
    /// not yet passed, dropping the overdue tick.
    fn check_overrun(&self, started: Instant, origin: Instant, interval: &mut Interval) {
        let took = started.elapsed();
        if took <= self.period {
            return;
        }
        match self.overrun {
            OverrunPolicy::Delay => warn!(
                took = ?took,
                period = ?self.period,
                "Publish overran interval, next tick fires now and cadence restarts"
            ),
            OverrunPolicy::Skip => {
                let now = Instant::now();
                let next = next_on_cadence(origin, self.period, now);
                let missed = (next - started).as_nanos() / self.period.as_nanos().max(1) - 1;
                warn!(
                    took = ?took,
                    period = ?self.period,
                    missed = u64::try_from(missed).unwrap_or(u64::MAX),
                    next_in = ?(next - now),
                    "Publish overran interval, dropping missed ticks"
                );
                interval.reset_at(next);
            }
        }
    }

    /// Run to completion. Returns once a stop is signalled and handled.
    pub(crate) async fn run(mut self, mut shutdown: Watcher) {
        let origin = Instant::now() + self.period;
        let mut interval = time::interval_at(origin, self.period);
        // skip realigns in check_overrun
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, overrun = ?self.overrun, "Scheduler started");

        loop {
            tokio::select! {
                biased;
                mode = shutdown.recv() => {
                    self.stop_idle(mode, &mut shutdown).await;
                    return;
                }
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            let batch = match self.machine.begin() {
                Ok(batch) => batch,
                Err(skipped) => {
                    self.report(skipped);
                    continue;
                }
            };
            let idx = batch.interval();
            let entries = batch.len();
            let publisher = Arc::clone(&self.publisher);
            let mut publish = publisher.publish(&batch);

            let result = tokio::select! {
                res = &mut publish => res,
                mode = shutdown.recv() => {
                    match mode {
                        StopMode::Forced => {
                            warn!(interval = idx, "Forced stop, abandoning in-flight publish");
                            self.abandon(idx);
                        }
                        StopMode::Graceful { timeout } => {
                            info!(interval = idx, ?timeout, "Graceful stop, draining in-flight publish");
                            let deadline = Instant::now() + timeout;
                            tokio::select! {
                                res = time::timeout_at(deadline, &mut publish) => match res {
                                    Ok(res) => {
                                        self.finish(idx, res, entries);
                                        self.final_flush(deadline, &mut shutdown).await;
                                    }
                                    Err(_) => {
                                        warn!(interval = idx, "Drain timed out, abandoning in-flight publish");
                                        self.abandon(idx);
                                    }
                                },
                                () = shutdown.forced() => {
                                    warn!(interval = idx, "Stop escalated, abandoning in-flight publish");
                                    self.abandon(idx);
                                }
                            }
                        }
                    }
                    return;
                }
            };
            self.finish(idx, result, entries);
            self.check_overrun(started, origin, &mut interval);
        }
    }

    async fn stop_idle(&mut self, mode: StopMode, shutdown: &mut Watcher) {
        match mode {
            StopMode::Forced => info!("Forced stop while idle"),
            StopMode::Graceful { timeout } => {
                info!(?timeout, "Graceful stop while idle");
                self.final_flush(Instant::now() + timeout, shutdown).await;
            }
        }
    }

    /// Publish whatever accumulated since the last tick, bounded by
    /// `deadline`.
    async fn final_flush(&mut self, deadline: Instant, shutdown: &mut Watcher) {
        if !self.flush_on_shutdown {
            return;
        }
        let batch = match self.machine.begin() {
            Ok(batch) => batch,
            Err(skipped) => {
                self.report(skipped);
                return;
            }
        };
        let idx = batch.interval();
        let entries = batch.len();
        let publisher = Arc::clone(&self.publisher);
        tokio::select! {
            res = time::timeout_at(deadline, publisher.publish(&batch)) => match res {
                Ok(res) => self.finish(idx, res, entries),
                Err(_) => {
                    warn!(interval = idx, "Final flush timed out");
                    self.abandon(idx);
                }
            },
            () = shutdown.forced() => {
                warn!(interval = idx, "Stop escalated, abandoning final flush");
                self.abandon(idx);
            }
        }
    }
}

/// First point of the cadence `origin + k * period` at or after `now`.
fn next_on_cadence(origin: Instant, period: Duration, now: Instant) -> Instant {
    let period_nanos = period.as_nanos().max(1);
    let periods = now
        .saturating_duration_since(origin)
        .as_nanos()
        .div_ceil(period_nanos);
    let offset = u64::try_from(periods * period_nanos).unwrap_or(u64::MAX);
    origin
        .checked_add(Duration::from_nanos(offset))
        .unwrap_or(now + period)
}
