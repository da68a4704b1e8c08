//! Concurrent mapping from [`MetricId`] to instrument.
//!
//! The map is split into shards, each its own `RwLock<FxHashMap>`, chosen by
//! the identity's hash. A write takes the shard read lock only long enough to
//! clone the instrument's `Arc` and applies the measurement after releasing it,
//! so the shard lock is never held across an instrument update. The write lock
//! is taken only the first time an identity is seen.
//!
//! Snapshots collect instrument handles shard by shard and read them with no
//! registry lock held. Cross-instrument simultaneity is not guaranteed; each
//! instrument's own value is internally consistent.

use std::{
    collections::BTreeMap,
    hash::{BuildHasher, BuildHasherDefault},
    sync::{Mutex, PoisonError, RwLock},
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHasher};
use tokio::time::Instant;
use tracing::trace;

use crate::{
    error::Error,
    identity::MetricId,
    instrument::{Instrument, Kind, Measurement},
    snapshot::{Entry, Snapshot},
};

const SHARDS: usize = 32;

type Shard = RwLock<FxHashMap<MetricId, Instrument>>;

/// Measured on the tokio clock, the one that drives the scheduler.
#[derive(Debug)]
struct IntervalClock {
    index: u64,
    started: Instant,
}

#[derive(Debug)]
pub(crate) struct Registry {
    shards: Box<[Shard]>,
    hasher: BuildHasherDefault<FxHasher>,
    reservoir_size: usize,
    /// Only touched by interval boundaries, never by writers.
    clock: Mutex<IntervalClock>,
}

impl Registry {
    pub(crate) fn new(reservoir_size: usize) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Shard::default()).collect(),
            hasher: BuildHasherDefault::default(),
            reservoir_size,
            clock: Mutex::new(IntervalClock {
                index: 0,
                started: Instant::now(),
            }),
        }
    }

    fn shard(&self, id: &MetricId) -> &Shard {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (self.hasher.hash_one(id) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Locate the instrument for `id`, creating it as `kind` on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeConflict`] if `id` already names an instrument of
    /// another kind.
    pub(crate) fn get_or_create(&self, id: &MetricId, kind: Kind) -> Result<Instrument, Error> {
        let shard = self.shard(id);
        let found = shard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        let instrument = if let Some(instrument) = found {
            instrument
        } else {
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            map.entry(id.clone())
                .or_insert_with(|| {
                    trace!(metric = %id, %kind, "registering instrument");
                    Instrument::new(kind, self.reservoir_size)
                })
                .clone()
        };

        if instrument.kind() != kind {
            return Err(Error::TypeConflict {
                name: id.to_string(),
                existing: instrument.kind(),
                requested: kind,
            });
        }
        Ok(instrument)
    }

    /// Apply `measurement` to the instrument for `id`.
    ///
    /// # Errors
    ///
    /// See [`Registry::get_or_create`].
    pub(crate) fn write(&self, id: &MetricId, measurement: Measurement) -> Result<(), Error> {
        let instrument = self.get_or_create(id, measurement.kind())?;
        let applied = instrument.apply(measurement);
        debug_assert!(applied, "kind checked by get_or_create");
        Ok(())
    }

    fn handles(&self) -> Vec<(MetricId, Instrument)> {
        let mut handles = Vec::new();
        for shard in &*self.shards {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            handles.extend(map.iter().map(|(id, inst)| (id.clone(), inst.clone())));
        }
        handles
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Add the summable value of every instrument named `name` in shard
    /// `shard` to `groups`, keyed by the values of `keys`. Instruments lacking
    /// any of `keys` are skipped. The shard lock is released before any
    /// instrument is read.
    pub(crate) fn sum_shard_into<S: AsRef<str>>(
        &self,
        shard: usize,
        name: &str,
        keys: &[S],
        groups: &mut BTreeMap<Vec<String>, f64>,
    ) {
        let found: Vec<(Vec<String>, Instrument)> = {
            let map = self.shards[shard]
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            map.iter()
                .filter(|(id, _)| id.name() == name)
                .filter_map(|(id, inst)| id.project(keys).map(|group| (group, inst.clone())))
                .collect()
        };
        for (group, inst) in found {
            *groups.entry(group).or_insert(0.0) += inst.summable();
        }
    }

    /// Grouped sum over every shard in one pass, see
    /// [`Registry::sum_shard_into`].
    #[cfg(test)]
    pub(crate) fn sum_by<S: AsRef<str>>(&self, name: &str, keys: &[S]) -> BTreeMap<Vec<String>, f64> {
        let mut groups = BTreeMap::new();
        for shard in 0..self.shards.len() {
            self.sum_shard_into(shard, name, keys, &mut groups);
        }
        groups
    }

    fn current_interval(&self) -> (u64, Duration) {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        (clock.index, clock.started.elapsed())
    }

    /// Read every instrument without resetting anything.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let (index, elapsed) = self.current_interval();
        let entries = self
            .handles()
            .into_iter()
            .map(|(id, inst)| Entry::new(id, inst.read(elapsed)))
            .collect();
        Snapshot::new(index, elapsed, entries)
    }

    /// Close the current interval: read and reset every interval instrument
    /// in one step per instrument, then start the next interval.
    pub(crate) fn take_interval(&self) -> Snapshot {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let index = clock.index;
        let elapsed = clock.started.elapsed();
        let entries = self
            .handles()
            .into_iter()
            .map(|(id, inst)| Entry::new(id, inst.take(elapsed)))
            .collect();
        clock.index += 1;
        clock.started = Instant::now();
        Snapshot::new(index, elapsed, entries)
    }

    /// Zero every counter, timer, meter and histogram and start the next
    /// interval. Gauges keep their value.
    pub(crate) fn reset_interval_instruments(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, inst) in self.handles() {
            inst.reset();
        }
        clock.index += 1;
        clock.started = Instant::now();
    }

    /// Number of registered instruments.
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub(crate) fn clear(&self) {
        for shard in &*self.shards {
            shard.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{instrument::DEFAULT_RESERVOIR_SIZE, snapshot::Value, tag::Tag};
    use proptest::prelude::*;
    use std::{sync::Arc, thread};

    fn id(name: &str, tags: &[(&str, &str)]) -> MetricId {
        MetricId::new(name, tags.iter().map(|(k, v)| Tag::new(*k, *v)))
    }

    #[test]
    fn type_conflict_leaves_existing_value() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        let x = id("x", &[]);
        r.write(&x, Measurement::Counter(3)).unwrap();
        let err = r.write(&x, Measurement::Gauge(1.0)).unwrap_err();
        assert_eq!(
            err,
            Error::TypeConflict {
                name: "x".into(),
                existing: Kind::Counter,
                requested: Kind::Gauge,
            }
        );
        assert_eq!(r.snapshot().get(&x), Some(&Value::Counter(3)));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn tag_order_addresses_the_same_instrument() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        r.write(&id("req", &[("a", "1"), ("b", "2")]), Measurement::Counter(1))
            .unwrap();
        r.write(&id("req", &[("b", "2"), ("a", "1")]), Measurement::Counter(1))
            .unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(
            r.snapshot().get(&id("req", &[("a", "1"), ("b", "2")])),
            Some(&Value::Counter(2))
        );
    }

    #[test]
    fn reset_law() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        let c = id("c", &[]);
        let g = id("g", &[]);
        let t = id("t", &[]);
        let m = id("m", &[]);
        let h = id("h", &[]);
        r.write(&c, Measurement::Counter(5)).unwrap();
        r.write(&g, Measurement::Gauge(2.5)).unwrap();
        r.write(&t, Measurement::Timer(Duration::from_millis(3))).unwrap();
        r.write(&m, Measurement::Meter(4)).unwrap();
        r.write(&h, Measurement::Histogram(9)).unwrap();

        let first = r.take_interval();
        assert_eq!(first.interval(), 0);
        assert_eq!(first.get(&c), Some(&Value::Counter(5)));

        let second = r.take_interval();
        assert_eq!(second.interval(), 1);
        for e in second.entries() {
            if e.id == g {
                assert_eq!(e.value, Value::Gauge(2.5));
            } else {
                assert!(e.value.is_empty(), "{} not reset: {:?}", e.id, e.value);
            }
        }
    }

    #[test]
    fn reset_interval_instruments_keeps_gauges() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        r.write(&id("c", &[]), Measurement::Counter(5)).unwrap();
        r.write(&id("g", &[]), Measurement::Gauge(1.0)).unwrap();
        r.reset_interval_instruments();
        let snap = r.snapshot();
        assert_eq!(snap.interval(), 1);
        assert_eq!(snap.get(&id("c", &[])), Some(&Value::Counter(0)));
        assert_eq!(snap.get(&id("g", &[])), Some(&Value::Gauge(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_length_follows_the_runtime_clock() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        let m = id("m", &[]);
        r.write(&m, Measurement::Meter(30)).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let snap = r.take_interval();
        assert_eq!(snap.elapsed(), Duration::from_secs(10));
        let Some(Value::Meter(meter)) = snap.get(&m) else {
            panic!("meter missing");
        };
        assert_eq!(meter.count, 30);
        assert!((meter.rate_per_second - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gauge_round_trip() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        let g = id("g", &[("k", "v")]);
        r.write(&g, Measurement::Gauge(42.25)).unwrap();
        assert_eq!(r.snapshot().get(&g), Some(&Value::Gauge(42.25)));
    }

    #[test]
    fn no_writes_lost_across_concurrent_takes() {
        let r = Arc::new(Registry::new(DEFAULT_RESERVOIR_SIZE));
        let c = id("c", &[]);
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        r.write(&c, Measurement::Counter(1)).unwrap();
                    }
                })
            })
            .collect();

        let mut total = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            if let Some(Value::Counter(v)) = r.take_interval().get(&c) {
                total += v;
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        if let Some(Value::Counter(v)) = r.take_interval().get(&c) {
            total += v;
        }
        assert_eq!(total, 20_000);
    }

    #[test]
    fn sum_by_groups_and_skips_missing_keys() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        r.write(&id("req", &[("env", "prod"), ("region", "us")]), Measurement::Counter(5))
            .unwrap();
        r.write(&id("req", &[("env", "prod"), ("region", "eu")]), Measurement::Counter(7))
            .unwrap();
        r.write(&id("req", &[("region", "us")]), Measurement::Counter(100))
            .unwrap();
        r.write(&id("other", &[("env", "prod")]), Measurement::Counter(1))
            .unwrap();

        let by_env = r.sum_by("req", &["env"]);
        assert_eq!(by_env.len(), 1);
        assert_eq!(by_env.get(&vec!["prod".to_string()]), Some(&12.0));

        let total = r.sum_by::<&str>("req", &[]);
        assert_eq!(total.get(&Vec::new()), Some(&112.0));
    }

    #[test]
    fn clear_drops_everything() {
        let r = Registry::new(DEFAULT_RESERVOIR_SIZE);
        r.write(&id("a", &[]), Measurement::Meter(1)).unwrap();
        r.clear();
        assert_eq!(r.len(), 0);
        assert!(r.snapshot().entries().is_empty());
    }

    proptest! {
        #[test]
        fn concurrent_counter_sum_is_exact(deltas in proptest::collection::vec(-100i64..100, 1..64)) {
            let r = Arc::new(Registry::new(DEFAULT_RESERVOIR_SIZE));
            let c = id("sum", &[("t", "x")]);
            let expected: i64 = deltas.iter().sum();
            let chunks: Vec<Vec<i64>> = deltas.chunks(8).map(<[i64]>::to_vec).collect();
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    let r = Arc::clone(&r);
                    let c = c.clone();
                    thread::spawn(move || {
                        for d in chunk {
                            r.write(&c, Measurement::Counter(d)).unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let snap = r.take_interval();
            prop_assert_eq!(snap.get(&c), Some(&Value::Counter(expected)));
        }
    }
}
