//! JSONL publisher
//!
//! Writes one JSON object per line, each line a single entry of a published
//! interval. Tags are flattened into the top-level object.

use std::{
    io::Write,
    sync::{Mutex, PoisonError},
    time::UNIX_EPOCH,
};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    instrument::Kind,
    publisher::{PublishError, Publisher},
    snapshot::{Entry, FilterResult, Value},
};

/// Tag names that collide with top-level fields of [`Line`]. Tags with these
/// names are dropped from the line.
const RESERVED_TAG_NAMES: &[&str] = &[
    "run_id",
    "time",
    "interval",
    "metric_name",
    "metric_kind",
    "value",
];

#[derive(Debug, Serialize)]
/// The structure of a published line.
pub struct Line<'a> {
    /// An id unique to this publisher instance, distinguishing output of
    /// separate runs appended to the same file.
    pub run_id: Uuid,
    /// Capture time of the interval in milliseconds since the epoch.
    pub time: u128,
    /// Index of the published interval.
    pub interval: u64,
    /// The name of the metric recorded by this line.
    pub metric_name: &'a str,
    /// The kind of metric recorded by this line.
    pub metric_kind: Kind,
    /// The value of the metric on this line.
    pub value: &'a Value,
    #[serde(flatten)]
    /// The tags associated with this metric.
    pub tags: FxHashMap<&'a str, &'a str>,
}

/// Publishes each interval as JSON lines to `W`.
///
/// Writes happen synchronously on the scheduler task; a slow writer delays
/// the next interval but never a metric write.
#[derive(Debug)]
pub struct JsonlPublisher<W: Write + Send> {
    run_id: Uuid,
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlPublisher<W> {
    /// Create a new instance of `JsonlPublisher`
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            writer: Mutex::new(writer),
        }
    }

    /// Id written into every line by this publisher.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Consume the publisher, returning the writer.
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn line<'a>(&self, time: u128, interval: u64, entry: &'a Entry) -> Line<'a> {
        let mut tags = FxHashMap::default();
        for tag in entry.id.tags() {
            if RESERVED_TAG_NAMES.contains(&tag.key()) {
                warn!(
                    tag_key = tag.key(),
                    metric_name = entry.id.name(),
                    "Filtered out reserved tag that would collide with line field"
                );
            } else {
                tags.insert(tag.key(), tag.value());
            }
        }
        Line {
            run_id: self.run_id,
            time,
            interval,
            metric_name: entry.id.name(),
            metric_kind: entry.value.kind(),
            value: &entry.value,
            tags,
        }
    }
}

#[async_trait]
impl<W: Write + Send> Publisher for JsonlPublisher<W> {
    async fn publish(&self, batch: &FilterResult) -> Result<(), PublishError> {
        let time = batch
            .taken_at()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in batch.entries() {
            let line = self.line(time, batch.interval(), entry);
            let payload = serde_json::to_string(&line)?;
            writer.write_all(payload.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        debug!(
            interval = batch.interval(),
            lines = batch.len(),
            "Published interval as JSONL"
        );
        Ok(())
    }
}
