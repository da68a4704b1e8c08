//! Bridge from the [`metrics`] facade into an [`Engine`].
//!
//! `metrics::counter!` feeds a counter, `metrics::gauge!` a gauge and
//! `metrics::histogram!` a histogram, with labels becoming tags. The handles
//! returned share state with the engine's instruments, so a handle kept
//! across intervals keeps writing into the live instrument.
//!
//! Registration failures (a type conflict, a stopped engine) are reported on
//! the engine's error channel and yield a no-op handle.

use metrics::{CounterFn, GaugeFn, HistogramFn, Key, KeyName, Metadata, SharedString, Unit};

use crate::{
    engine::Engine,
    error::Error,
    instrument::{Counter, Distribution, Gauge, Instrument, Kind},
    tag::Tag,
};

impl CounterFn for Counter {
    fn increment(&self, value: u64) {
        Counter::increment(self, i64::try_from(value).unwrap_or(i64::MAX));
    }

    fn absolute(&self, value: u64) {
        Counter::absolute(self, i64::try_from(value).unwrap_or(i64::MAX));
    }
}

impl GaugeFn for Gauge {
    fn increment(&self, value: f64) {
        self.add(value);
    }

    fn decrement(&self, value: f64) {
        self.add(-value);
    }

    fn set(&self, value: f64) {
        Gauge::set(self, value);
    }
}

impl HistogramFn for Distribution {
    #[allow(clippy::cast_possible_truncation)]
    fn record(&self, value: f64) {
        // `as` saturates and maps NaN to zero.
        Distribution::record(self, value.round() as i64);
    }
}

/// A [`metrics::Recorder`] writing into an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineRecorder {
    engine: Engine,
}

impl EngineRecorder {
    /// Create a recorder for `engine`.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    fn instrument(&self, key: &Key, kind: Kind) -> Option<Instrument> {
        let tags: Vec<Tag> = key
            .labels()
            .map(|label| Tag::new(label.key(), label.value()))
            .collect();
        match self.engine.instrument(key.name(), kind, &tags) {
            Ok(instrument) => Some(instrument),
            Err(error) => {
                self.engine.report(error);
                None
            }
        }
    }
}

impl metrics::Recorder for EngineRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
        // nothing, intentionally
    }

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> metrics::Counter {
        match self.instrument(key, Kind::Counter) {
            Some(Instrument::Counter(c)) => metrics::Counter::from_arc(c),
            _ => metrics::Counter::noop(),
        }
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> metrics::Gauge {
        match self.instrument(key, Kind::Gauge) {
            Some(Instrument::Gauge(g)) => metrics::Gauge::from_arc(g),
            _ => metrics::Gauge::noop(),
        }
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> metrics::Histogram {
        match self.instrument(key, Kind::Histogram) {
            Some(Instrument::Histogram(h)) => metrics::Histogram::from_arc(h),
            _ => metrics::Histogram::noop(),
        }
    }
}

impl Engine {
    /// Install this engine as the global [`metrics::Recorder`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecorderInstalled`] if a global recorder is already
    /// set.
    pub fn install_global_recorder(&self) -> Result<(), Error> {
        let recorder = EngineRecorder::new(self.clone());
        metrics::set_global_recorder(recorder).map_err(|_| Error::RecorderInstalled)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, identity::MetricId, signal::StopMode, snapshot::Value};

    #[tokio::test]
    async fn metrics_macros_feed_the_engine() {
        let engine = Builder::new().add_global_tag("service", "api").build().unwrap();
        let recorder = EngineRecorder::new(engine.clone());

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("requests", "env" => "prod").increment(10);
            metrics::counter!("requests", "env" => "prod").increment(20);
            metrics::gauge!("load").set(4.0);
            metrics::gauge!("load").decrement(1.5);
            metrics::histogram!("size").record(12.4);
        });

        let snap = engine.snapshot().unwrap();
        let requests = MetricId::new(
            "requests",
            [Tag::new("env", "prod"), Tag::new("service", "api")],
        );
        assert_eq!(snap.get(&requests), Some(&Value::Counter(30)));
        let load = MetricId::new("load", [Tag::new("service", "api")]);
        assert_eq!(snap.get(&load), Some(&Value::Gauge(2.5)));
        let size = MetricId::new("size", [Tag::new("service", "api")]);
        let Some(Value::Histogram(summary)) = snap.get(&size) else {
            panic!("histogram missing");
        };
        assert_eq!((summary.count, summary.max), (1, 12));
        engine.stop(StopMode::Forced).await;
    }

    #[tokio::test]
    async fn conflicting_registration_is_reported_and_ignored() {
        let engine = Builder::new().build().unwrap();
        let mut errors = engine.errors();
        engine.increment_counter_by("x", 3, &[]);
        let recorder = EngineRecorder::new(engine.clone());

        metrics::with_local_recorder(&recorder, || {
            metrics::gauge!("x").set(99.0);
        });

        assert!(matches!(
            errors.recv().await.unwrap(),
            Error::TypeConflict { .. }
        ));
        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.get(&MetricId::new("x", [])), Some(&Value::Counter(3)));
        engine.stop(StopMode::Forced).await;
    }
}
