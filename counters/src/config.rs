//! Engine configuration, parsed from YAML or built in code.
//!
//! Every field has an explicit default so that an empty document is a valid
//! configuration.

use std::{fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{instrument::DEFAULT_RESERVOIR_SIZE, signal::StopMode};

/// Interval between publishes when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: std::path::PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The interval must be non-zero.
    #[error("interval_milliseconds must be greater than zero")]
    ZeroInterval,
}

/// What the scheduler does when a publish outlasts the interval.
///
/// Ticks never overlap under either policy.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// The missed tick fires as soon as the slow publish returns, then the
    /// cadence restarts from that point.
    #[default]
    Delay,
    /// Missed ticks are dropped with a warning and the next tick fires on
    /// the original cadence.
    Skip,
}

/// How [`crate::Engine::shutdown`] stops the scheduler.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ShutdownPolicy {
    /// Drain the in-flight publish within a bound.
    Graceful {
        /// Upper bound on draining, milliseconds
        timeout_milliseconds: u64,
    },
    /// Abandon the in-flight publish.
    Forced,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::Graceful {
            timeout_milliseconds: 5_000,
        }
    }
}

impl From<ShutdownPolicy> for StopMode {
    fn from(policy: ShutdownPolicy) -> Self {
        match policy {
            ShutdownPolicy::Graceful {
                timeout_milliseconds,
            } => StopMode::Graceful {
                timeout: Duration::from_millis(timeout_milliseconds),
            },
            ShutdownPolicy::Forced => StopMode::Forced,
        }
    }
}

fn default_interval_milliseconds() -> u64 {
    u64::try_from(DEFAULT_INTERVAL.as_millis()).unwrap_or(u64::MAX)
}

fn default_flush_on_shutdown() -> bool {
    true
}

fn default_reservoir_size() -> usize {
    DEFAULT_RESERVOIR_SIZE
}

fn default_error_channel_capacity() -> usize {
    256
}

/// Main configuration struct for the engine
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Length of one aggregation interval.
    #[serde(default = "default_interval_milliseconds")]
    pub interval_milliseconds: u64,
    /// Behavior when a publish outlasts the interval.
    #[serde(default)]
    pub overrun: OverrunPolicy,
    /// Behavior of [`crate::Engine::shutdown`].
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub shutdown: ShutdownPolicy,
    /// Publish the partial final interval during a graceful stop.
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,
    /// Tags added to every measurement. Per-call tags with the same key win.
    #[serde(default)]
    pub global_tags: FxHashMap<String, String>,
    /// Samples retained per timer or histogram for percentiles.
    #[serde(default = "default_reservoir_size")]
    pub reservoir_size: usize,
    /// Errors buffered per error channel subscriber before the oldest are
    /// dropped.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_milliseconds: default_interval_milliseconds(),
            overrun: OverrunPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            flush_on_shutdown: default_flush_on_shutdown(),
            global_tags: FxHashMap::default(),
            reservoir_size: default_reservoir_size(),
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

impl Config {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML for this struct or
    /// sets a zero interval.
    pub fn from_yaml_str(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml_str(&contents)
    }

    /// The interval as a `Duration`.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_milliseconds)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.interval_milliseconds == 0 {
            return Err(Error::ZeroInterval);
        }
        Ok(())
    }
}
