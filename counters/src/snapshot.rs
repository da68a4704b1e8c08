//! Point-in-time captures of the registry.

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::{identity::MetricId, instrument::Kind};

/// Statistics for a timer or histogram over one interval.
///
/// Timer values are nanoseconds. An empty interval is all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DistributionSummary {
    /// Number of samples
    pub count: u64,
    /// Sum of samples, saturating
    pub sum: i64,
    /// Smallest sample
    pub min: i64,
    /// Largest sample
    pub max: i64,
    /// `sum / count`
    pub mean: f64,
    /// 50th percentile
    pub p50: i64,
    /// 75th percentile
    pub p75: i64,
    /// 95th percentile
    pub p95: i64,
    /// 99th percentile
    pub p99: i64,
    /// 99.9th percentile
    pub p999: i64,
}

/// Count and rate of a meter over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeterSummary {
    /// Marks recorded in the interval
    pub count: u64,
    /// `count` divided by the interval length in seconds, zero for an
    /// interval of zero length
    pub rate_per_second: f64,
}

impl MeterSummary {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn new(count: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate_per_second = if secs > 0.0 { count as f64 / secs } else { 0.0 };
        Self {
            count,
            rate_per_second,
        }
    }
}

/// The aggregated value of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Counter delta for the interval
    Counter(i64),
    /// Last gauge value
    Gauge(f64),
    /// Timer statistics, nanoseconds
    Timer(DistributionSummary),
    /// Meter count and rate
    Meter(MeterSummary),
    /// Histogram statistics
    Histogram(DistributionSummary),
}

impl Value {
    /// Kind of instrument that produced this value.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Value::Counter(_) => Kind::Counter,
            Value::Gauge(_) => Kind::Gauge,
            Value::Timer(_) => Kind::Timer,
            Value::Meter(_) => Kind::Meter,
            Value::Histogram(_) => Kind::Histogram,
        }
    }

    /// Whether this is the zero value of an interval instrument. Gauges are
    /// never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Counter(v) => *v == 0,
            Value::Gauge(_) => false,
            Value::Meter(m) => m.count == 0,
            Value::Timer(d) | Value::Histogram(d) => d.count == 0,
        }
    }

    /// The contribution of this value to a grouped sum: the counter delta,
    /// the gauge value, or the number of timer, meter or histogram events.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summable(&self) -> f64 {
        match self {
            Value::Counter(v) => *v as f64,
            Value::Gauge(v) => *v,
            Value::Meter(m) => m.count as f64,
            Value::Timer(d) | Value::Histogram(d) => d.count as f64,
        }
    }
}

/// One identity and its aggregated value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    /// Identity of the instrument
    pub id: MetricId,
    /// Aggregated value
    pub value: Value,
}

impl Entry {
    /// Construct an entry.
    #[must_use]
    pub fn new(id: MetricId, value: Value) -> Self {
        Self { id, value }
    }
}

/// Every registered instrument's value at capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    interval: u64,
    elapsed: Duration,
    taken_at: SystemTime,
    entries: Vec<Entry>,
}

impl Snapshot {
    pub(crate) fn new(interval: u64, elapsed: Duration, entries: Vec<Entry>) -> Self {
        Self {
            interval,
            elapsed,
            taken_at: SystemTime::now(),
            entries,
        }
    }

    /// Index of the interval this snapshot closes, starting at zero.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Length of the interval covered by this snapshot.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Wall-clock time of capture.
    #[must_use]
    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    /// Captured entries, in no particular order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Find the entry for `id`.
    #[must_use]
    pub fn get(&self, id: &MetricId) -> Option<&Value> {
        self.entries.iter().find(|e| &e.id == id).map(|e| &e.value)
    }

    pub(crate) fn into_parts(self) -> (SnapshotMeta, Vec<Entry>) {
        (
            SnapshotMeta {
                interval: self.interval,
                elapsed: self.elapsed,
                taken_at: self.taken_at,
            },
            self.entries,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SnapshotMeta {
    pub(crate) interval: u64,
    pub(crate) elapsed: Duration,
    pub(crate) taken_at: SystemTime,
}

/// The output of the filter chain, handed to the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    meta: SnapshotMeta,
    entries: Vec<Entry>,
}

impl FilterResult {
    pub(crate) fn new(meta: SnapshotMeta, entries: Vec<Entry>) -> Self {
        Self { meta, entries }
    }

    /// Index of the interval the entries belong to.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.meta.interval
    }

    /// Length of the interval.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.meta.elapsed
    }

    /// Wall-clock time the underlying snapshot was taken.
    #[must_use]
    pub fn taken_at(&self) -> SystemTime {
        self.meta.taken_at
    }

    /// Entries surviving the filter chain.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries survived the filter chain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_rate_divides_by_interval() {
        let m = MeterSummary::new(30, Duration::from_secs(10));
        assert!((m.rate_per_second - 3.0).abs() < f64::EPSILON);
        assert!(MeterSummary::new(30, Duration::ZERO).rate_per_second.abs() < f64::EPSILON);
    }

    #[test]
    fn zero_values_are_empty_except_gauges() {
        assert!(Value::Counter(0).is_empty());
        assert!(!Value::Counter(-1).is_empty());
        assert!(!Value::Gauge(0.0).is_empty());
        assert!(Value::Timer(DistributionSummary::default()).is_empty());
        assert!(Value::Meter(MeterSummary::default()).is_empty());
    }

    #[test]
    fn summable_uses_count_for_distributions() {
        let d = DistributionSummary {
            count: 4,
            sum: 400,
            ..DistributionSummary::default()
        };
        assert!((Value::Histogram(d).summable() - 4.0).abs() < f64::EPSILON);
        assert!((Value::Timer(d).summable() - 4.0).abs() < f64::EPSILON);
        assert!((Value::Counter(7).summable() - 7.0).abs() < f64::EPSILON);
    }
}
