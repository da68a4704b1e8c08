//! Instruments hold the accumulated state of one [`crate::MetricId`].
//!
//! Every instrument is safe to update from any number of threads at once.
//! Counters, gauges and meters are single atomics. Timers and histograms are a
//! [`Distribution`] behind a per-instrument mutex whose critical section is a
//! handful of integer operations. No instrument shares a lock with another
//! instrument or with the registry.
//!
//! Interval instruments (everything but [`Gauge`]) support `take`, which reads
//! and resets in one step so that a write racing with the end of an interval
//! lands in exactly one of the two intervals.

use std::{
    fmt, mem,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::snapshot::{DistributionSummary, MeterSummary, Value};

/// Default number of samples a [`Distribution`] retains for percentiles.
pub const DEFAULT_RESERVOIR_SIZE: usize = 1024;

/// The kind of an instrument, fixed at first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Signed interval accumulator
    Counter,
    /// Last-write-wins scalar
    Gauge,
    /// Distribution of durations in nanoseconds
    Timer,
    /// Event count with derived rate
    Meter,
    /// Distribution of unit-less integers
    Histogram,
}

impl Kind {
    /// Whether instruments of this kind are zeroed at the end of every
    /// interval.
    #[must_use]
    pub fn resets_each_interval(self) -> bool {
        !matches!(self, Kind::Gauge)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Timer => "timer",
            Kind::Meter => "meter",
            Kind::Histogram => "histogram",
        })
    }
}

/// A single write, carrying the kind of instrument it addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// Add to a counter. May be negative.
    Counter(i64),
    /// Set a gauge.
    Gauge(f64),
    /// Record one timer sample.
    Timer(Duration),
    /// Mark a meter `n` times.
    Meter(u64),
    /// Record one histogram sample.
    Histogram(i64),
}

impl Measurement {
    /// Kind of instrument this measurement must be applied to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Measurement::Counter(_) => Kind::Counter,
            Measurement::Gauge(_) => Kind::Gauge,
            Measurement::Timer(_) => Kind::Timer,
            Measurement::Meter(_) => Kind::Meter,
            Measurement::Histogram(_) => Kind::Histogram,
        }
    }
}

/// Signed accumulator reset every interval.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    /// Add `delta`, wrapping on overflow.
    pub fn increment(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Overwrite the accumulated value.
    pub fn absolute(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current accumulated value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(crate) fn take(&self) -> i64 {
        self.value.swap(0, Ordering::AcqRel)
    }
}

/// Last-write-wins scalar. Never reset.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    /// Replace the current value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` to the current value.
    pub fn add(&self, delta: f64) {
        // There's no atomic f64 so we CAS the bit pattern.
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(old) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(x) => old = x,
            }
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Event counter reset every interval. The rate is derived from the count and
/// the interval length when the meter is read.
#[derive(Debug, Default)]
pub struct Meter {
    count: AtomicU64,
}

impl Meter {
    /// Record `n` occurrences.
    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Occurrences so far this interval.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
struct Samples {
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
    /// Most recent samples, overwritten circularly once full.
    reservoir: Vec<i64>,
    pos: usize,
    capacity: usize,
}

impl Samples {
    fn new(capacity: usize) -> Self {
        Self {
            count: 0,
            sum: 0,
            min: 0,
            max: 0,
            reservoir: Vec::new(),
            pos: 0,
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);

        if self.reservoir.len() < self.capacity {
            self.reservoir.push(value);
        } else {
            self.reservoir[self.pos] = value;
        }
        self.pos = (self.pos + 1) % self.capacity;
    }

    #[allow(clippy::cast_precision_loss)]
    fn summarize(mut self) -> DistributionSummary {
        if self.count == 0 {
            return DistributionSummary::default();
        }
        self.reservoir.sort_unstable();
        let sorted = &self.reservoir;
        DistributionSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum as f64 / self.count as f64,
            p50: percentile(sorted, 500),
            p75: percentile(sorted, 750),
            p95: percentile(sorted, 950),
            p99: percentile(sorted, 990),
            p999: percentile(sorted, 999),
        }
    }
}

/// Nearest-rank percentile of `sorted`, `per_mille` in 0..=1000.
#[allow(clippy::cast_possible_truncation)]
fn percentile(sorted: &[i64], per_mille: u64) -> i64 {
    let len = sorted.len();
    if len == 0 {
        return 0;
    }
    let rank = (per_mille * len as u64).div_ceil(1000) as usize;
    sorted[rank.saturating_sub(1).min(len - 1)]
}

/// Distribution of integer samples backing timers and histograms.
///
/// Count, sum, min and max are exact over the interval. Percentiles are
/// computed from the most recent `capacity` samples.
#[derive(Debug)]
pub struct Distribution {
    samples: Mutex<Samples>,
    capacity: usize,
}

impl Distribution {
    /// Create an empty distribution retaining up to `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(Samples::new(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Samples> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one sample.
    pub fn record(&self, value: i64) {
        self.lock().record(value);
    }

    /// Number of samples recorded this interval.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Summarize the interval so far without resetting it.
    #[must_use]
    pub fn summary(&self) -> DistributionSummary {
        let samples = self.lock().clone();
        samples.summarize()
    }

    pub(crate) fn take(&self) -> DistributionSummary {
        let samples = mem::replace(&mut *self.lock(), Samples::new(self.capacity));
        samples.summarize()
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR_SIZE)
    }
}

pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// A registered instrument of any kind.
#[derive(Debug, Clone)]
pub(crate) enum Instrument {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Timer(Arc<Distribution>),
    Meter(Arc<Meter>),
    Histogram(Arc<Distribution>),
}

impl Instrument {
    pub(crate) fn new(kind: Kind, reservoir_size: usize) -> Self {
        match kind {
            Kind::Counter => Instrument::Counter(Arc::default()),
            Kind::Gauge => Instrument::Gauge(Arc::default()),
            Kind::Timer => Instrument::Timer(Arc::new(Distribution::new(reservoir_size))),
            Kind::Meter => Instrument::Meter(Arc::default()),
            Kind::Histogram => Instrument::Histogram(Arc::new(Distribution::new(reservoir_size))),
        }
    }

    pub(crate) fn kind(&self) -> Kind {
        match self {
            Instrument::Counter(_) => Kind::Counter,
            Instrument::Gauge(_) => Kind::Gauge,
            Instrument::Timer(_) => Kind::Timer,
            Instrument::Meter(_) => Kind::Meter,
            Instrument::Histogram(_) => Kind::Histogram,
        }
    }

    /// Apply `m`. Returns false, touching nothing, if `m` addresses another
    /// kind.
    pub(crate) fn apply(&self, m: Measurement) -> bool {
        match (self, m) {
            (Instrument::Counter(c), Measurement::Counter(delta)) => c.increment(delta),
            (Instrument::Gauge(g), Measurement::Gauge(value)) => g.set(value),
            (Instrument::Timer(t), Measurement::Timer(d)) => t.record(duration_nanos(d)),
            (Instrument::Meter(m), Measurement::Meter(n)) => m.mark(n),
            (Instrument::Histogram(h), Measurement::Histogram(v)) => h.record(v),
            _ => return false,
        }
        true
    }

    /// Read the current aggregate without resetting.
    pub(crate) fn read(&self, elapsed: Duration) -> Value {
        match self {
            Instrument::Counter(c) => Value::Counter(c.get()),
            Instrument::Gauge(g) => Value::Gauge(g.get()),
            Instrument::Timer(t) => Value::Timer(t.summary()),
            Instrument::Meter(m) => Value::Meter(MeterSummary::new(m.count(), elapsed)),
            Instrument::Histogram(h) => Value::Histogram(h.summary()),
        }
    }

    /// Read the current aggregate and reset interval state in one step.
    pub(crate) fn take(&self, elapsed: Duration) -> Value {
        match self {
            Instrument::Counter(c) => Value::Counter(c.take()),
            Instrument::Gauge(g) => Value::Gauge(g.get()),
            Instrument::Timer(t) => Value::Timer(t.take()),
            Instrument::Meter(m) => Value::Meter(MeterSummary::new(m.take(), elapsed)),
            Instrument::Histogram(h) => Value::Histogram(h.take()),
        }
    }

    pub(crate) fn reset(&self) {
        match self {
            Instrument::Counter(c) => {
                c.take();
            }
            Instrument::Gauge(_) => {}
            Instrument::Meter(m) => {
                m.take();
            }
            Instrument::Timer(d) | Instrument::Histogram(d) => {
                d.take();
            }
        }
    }

    /// The value this instrument contributes to a grouped sum.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn summable(&self) -> f64 {
        match self {
            Instrument::Counter(c) => c.get() as f64,
            Instrument::Gauge(g) => g.get(),
            Instrument::Meter(m) => m.count() as f64,
            Instrument::Timer(d) | Instrument::Histogram(d) => d.count() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn counter_take_resets_to_zero() {
        let c = Counter::default();
        c.increment(5);
        c.increment(-2);
        assert_eq!(c.take(), 3);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn gauge_add_and_set() {
        let g = Gauge::default();
        g.set(1.5);
        g.add(2.0);
        assert!((g.get() - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn distribution_summary_statistics() {
        let d = Distribution::new(16);
        for v in 1..=10 {
            d.record(v);
        }
        let s = d.summary();
        assert_eq!(s.count, 10);
        assert_eq!(s.sum, 55);
        assert_eq!(s.min, 1);
        assert_eq!(s.max, 10);
        assert!((s.mean - 5.5).abs() < f64::EPSILON);
        assert_eq!(s.p50, 5);
        assert_eq!(s.p95, 10);
        // summary does not reset
        assert_eq!(d.count(), 10);
    }

    #[test]
    fn distribution_reservoir_is_bounded_but_count_is_exact() {
        let d = Distribution::new(4);
        for v in 0..100 {
            d.record(v);
        }
        let s = d.take();
        assert_eq!(s.count, 100);
        assert_eq!(s.min, 0);
        assert_eq!(s.max, 99);
        // percentiles come from the last four samples
        assert_eq!(s.p50, 97);
        assert_eq!(d.count(), 0);
        assert_eq!(d.take(), DistributionSummary::default());
    }

    #[test]
    fn apply_rejects_other_kinds() {
        let inst = Instrument::new(Kind::Counter, 8);
        assert!(!inst.apply(Measurement::Gauge(1.0)));
        assert!(inst.apply(Measurement::Counter(2)));
        assert_eq!(inst.read(Duration::ZERO), Value::Counter(2));
    }

    #[test]
    fn gauge_survives_take() {
        let inst = Instrument::new(Kind::Gauge, 8);
        inst.apply(Measurement::Gauge(4.0));
        assert_eq!(inst.take(Duration::ZERO), Value::Gauge(4.0));
        assert_eq!(inst.take(Duration::ZERO), Value::Gauge(4.0));
    }

    #[test]
    fn concurrent_increments_are_exact() {
        let c = Arc::new(Counter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        c.increment(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get(), 8_000);
    }

    proptest! {
        #[test]
        fn percentiles_are_ordered_and_bounded(values in proptest::collection::vec(-1_000i64..1_000, 1..200)) {
            let d = Distribution::new(DEFAULT_RESERVOIR_SIZE);
            for v in &values {
                d.record(*v);
            }
            let s = d.take();
            prop_assert_eq!(s.count, u64::try_from(values.len()).unwrap());
            prop_assert_eq!(s.sum, values.iter().sum::<i64>());
            prop_assert!(s.min <= s.p50);
            prop_assert!(s.p50 <= s.p75);
            prop_assert!(s.p75 <= s.p95);
            prop_assert!(s.p95 <= s.p99);
            prop_assert!(s.p99 <= s.p999);
            prop_assert!(s.p999 <= s.max);
        }
    }
}
