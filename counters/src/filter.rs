//! The filter pipeline applied to each snapshot before publishing.
//!
//! A [`Filter`] is a plain function value from entries to entries. Filters
//! must be pure: they see only the entries they are handed and keep no
//! shared state, so a chain can be composed and tested in isolation.

use std::{fmt, sync::Arc};

use crate::snapshot::{Entry, FilterResult, Snapshot};

/// A single pipeline stage. May drop entries or transform values.
pub type Filter = Arc<dyn Fn(Vec<Entry>) -> Vec<Entry> + Send + Sync>;

/// Wrap a closure as a [`Filter`].
pub fn from_fn<F>(f: F) -> Filter
where
    F: Fn(Vec<Entry>) -> Vec<Entry> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Keep only entries whose metric name starts with `prefix`.
pub fn name_prefix<S: Into<String>>(prefix: S) -> Filter {
    let prefix = prefix.into();
    Arc::new(move |entries: Vec<Entry>| {
        entries
            .into_iter()
            .filter(|e| e.id.name().starts_with(prefix.as_str()))
            .collect()
    })
}

/// Keep only entries carrying a tag with `key`.
pub fn has_tag<S: Into<String>>(key: S) -> Filter {
    let key = key.into();
    Arc::new(move |entries: Vec<Entry>| {
        entries
            .into_iter()
            .filter(|e| e.id.tag(&key).is_some())
            .collect()
    })
}

/// Drop interval instruments that saw no writes this interval.
#[must_use]
pub fn drop_empty() -> Filter {
    Arc::new(|entries: Vec<Entry>| entries.into_iter().filter(|e| !e.value.is_empty()).collect())
}

/// An ordered sequence of filters. The empty chain passes everything
/// through.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `filter` to the end of the chain.
    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    /// Number of filters in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True for the pass-through chain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter in order over `snapshot`.
    #[must_use]
    pub fn apply(&self, snapshot: Snapshot) -> FilterResult {
        let (meta, entries) = snapshot.into_parts();
        let entries = self.filters.iter().fold(entries, |acc, f| f(acc));
        FilterResult::new(meta, entries)
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl FromIterator<Filter> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}
