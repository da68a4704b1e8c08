//! In-process tagged metrics aggregation.
//!
//! Application code records counters, gauges, timers, meters and histograms
//! through an [`Engine`], tagging each measurement with key/value
//! dimensions. A background scheduler closes an interval on a fixed cadence,
//! runs the [`FilterChain`] over the captured values and hands the result to
//! a [`Publisher`]. [`Engine::sum_query`] answers grouped sums over the local
//! registry at any time.
//!
//! Writes never wait on the publisher. Errors that cannot be returned to a
//! caller are logged and broadcast on [`Engine::errors`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod identity;
pub mod instrument;
pub mod publisher;
pub mod query;
pub mod recorder;
mod registry;
pub mod scheduler;
pub mod signal;
pub mod snapshot;
pub mod tag;


pub use builder::Builder;
pub use config::Config;
pub use engine::Engine;
pub use error::Error;
pub use filter::{Filter, FilterChain};
pub use identity::MetricId;
pub use instrument::{Kind, Measurement};
pub use publisher::{PublishError, Publisher};
pub use query::{GroupedSums, QueryHandle};
pub use recorder::EngineRecorder;
pub use scheduler::{TickOutcome, TickReport};
pub use signal::StopMode;
pub use snapshot::{Entry, FilterResult, Snapshot, Value};
pub use tag::Tag;
