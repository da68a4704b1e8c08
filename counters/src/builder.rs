//! Construction of an [`Engine`].

use std::{fmt, sync::Arc, time::Duration};

use tokio::runtime::Handle;

use crate::{
    config::Config,
    engine::Engine,
    error::Error,
    filter::{Filter, FilterChain},
    publisher::{Discard, Publisher},
    tag::Tag,
};

/// Collects global tags, filters, the interval and the publisher, then
/// starts an [`Engine`].
///
/// Without a publisher, intervals are aggregated and discarded.
#[derive(Default)]
#[must_use]
pub struct Builder {
    config: Config,
    global_tags: Vec<Tag>,
    filters: FilterChain,
    publisher: Option<Arc<dyn Publisher>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("global_tags", &self.global_tags)
            .field("filters", &self.filters)
            .field("publisher", &self.publisher.is_some())
            .finish()
    }
}

impl Builder {
    /// A builder with the default [`Config`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration. Global tags it names are applied before
    /// any added with [`Builder::add_global_tag`].
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Add a tag to every measurement. A later tag with the same key wins.
    pub fn add_global_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.global_tags.push(Tag::new(key, value));
        self
    }

    /// Append `filter` to the filter chain.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the aggregation interval. Millisecond resolution: a fractional
    /// millisecond rounds up, so only [`Duration::ZERO`] is rejected by
    /// [`Builder::build`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval_milliseconds =
            u64::try_from(interval.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX);
        self
    }

    /// Publish each interval to `publisher`.
    pub fn with_publisher<P>(self, publisher: P) -> Self
    where
        P: Publisher + 'static,
    {
        self.with_shared_publisher(Arc::new(publisher))
    }

    /// Publish each interval to a publisher shared with other code.
    pub fn with_shared_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Start the engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`] outside a tokio runtime,
    /// [`Error::InvalidConfig`] for an unusable configuration and
    /// [`Error::InvalidTag`] for a global tag with an empty key.
    pub fn build(self) -> Result<Engine, Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        self.config.validate().map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })?;

        let mut config_tags: Vec<Tag> = self
            .config
            .global_tags
            .iter()
            .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
            .collect();
        // FxHashMap iteration order is arbitrary; keys are unique so sorting
        // only fixes the order.
        config_tags.sort();
        let mut global_tags = config_tags;
        global_tags.extend(self.global_tags);
        for tag in &global_tags {
            tag.validate()?;
        }

        let publisher = self.publisher.unwrap_or_else(|| Arc::new(Discard));
        Ok(Engine::launch(
            runtime,
            &self.config,
            global_tags,
            self.filters,
            publisher,
        ))
    }
}
