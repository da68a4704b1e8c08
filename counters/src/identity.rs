//! Registry keys: a metric name plus a normalized tag set.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{error::Error, tag::Tag};

/// The identity of a single time series.
///
/// Tags are kept sorted by key with unique keys, so two identities built from
/// the same tags in different orders compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId {
    name: String,
    tags: Box<[Tag]>,
}

impl MetricId {
    /// Build an identity. When `tags` repeats a key the last value wins.
    pub fn new<N, I>(name: N, tags: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = Tag>,
    {
        let mut merged = BTreeMap::new();
        for tag in tags {
            merged.insert(tag.key().to_owned(), tag);
        }
        Self {
            name: name.into(),
            tags: merged.into_values().collect(),
        }
    }

    /// Build the identity a write resolves to: `global` tags first, then
    /// `call` tags overriding any global tag with the same key.
    ///
    /// Tags with an empty key are dropped and returned as
    /// [`Error::InvalidTag`] alongside the identity.
    pub(crate) fn resolve(name: &str, global: &[Tag], call: &[Tag]) -> (Self, Vec<Error>) {
        let mut rejected = Vec::new();
        let valid = call.iter().filter(|tag| match tag.validate() {
            Ok(()) => true,
            Err(e) => {
                rejected.push(e);
                false
            }
        });
        let id = Self::new(name, global.iter().chain(valid).cloned());
        (id, rejected)
    }

    /// The metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags sorted by key.
    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Value of the tag with `key`, if present.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|t| t.key().cmp(key))
            .ok()
            .map(|idx| self.tags[idx].value())
    }

    /// Project the tag set onto `keys`, returning the values in the order of
    /// `keys`. `None` if any key is absent.
    #[must_use]
    pub fn project<S: AsRef<str>>(&self, keys: &[S]) -> Option<Vec<String>> {
        keys.iter()
            .map(|k| self.tag(k.as_ref()).map(str::to_owned))
            .collect()
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (idx, tag) in self.tags.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{tag}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        collections::hash_map::DefaultHasher,
        hash::{Hash, Hasher},
    };

    fn hash_of(id: &MetricId) -> u64 {
        let mut h = DefaultHasher::new();
        id.hash(&mut h);
        h.finish()
    }

    #[test]
    fn duplicate_keys_last_write_wins() {
        let id = MetricId::new("m", [Tag::new("a", "1"), Tag::new("a", "2")]);
        assert_eq!(id.tags(), &[Tag::new("a", "2")]);
    }

    #[test]
    fn call_tag_overrides_global() {
        let global = [Tag::new("app", "web"), Tag::new("env", "prod")];
        let (id, rejected) = MetricId::resolve("m", &global, &[Tag::new("env", "dev")]);
        assert!(rejected.is_empty());
        assert_eq!(id.tag("env"), Some("dev"));
        assert_eq!(id.tag("app"), Some("web"));
    }

    #[test]
    fn empty_key_is_dropped_and_reported() {
        let (id, rejected) = MetricId::resolve("m", &[], &[Tag::new("", "x"), Tag::new("k", "v")]);
        assert_eq!(id.tags(), &[Tag::new("k", "v")]);
        assert_eq!(rejected, vec![Error::InvalidTag { value: "x".into() }]);
    }

    #[test]
    fn project_orders_by_requested_keys() {
        let id = MetricId::new("req", [Tag::new("region", "us"), Tag::new("env", "prod")]);
        assert_eq!(
            id.project(&["region", "env"]),
            Some(vec!["us".to_owned(), "prod".to_owned()])
        );
        assert_eq!(id.project(&["env", "zone"]), None);
        assert_eq!(id.project::<&str>(&[]), Some(vec![]));
    }

    #[test]
    fn display_renders_sorted_tags() {
        let id = MetricId::new("req", [Tag::new("b", "2"), Tag::new("a", "1")]);
        assert_eq!(id.to_string(), "req{a=1,b=2}");
        assert_eq!(MetricId::new("bare", []).to_string(), "bare");
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(
            pairs in proptest::collection::btree_map("[a-e]", "[a-z]{0,3}", 0..6),
            seed in any::<u64>(),
        ) {
            let tags: Vec<Tag> = pairs.iter().map(|(k, v)| Tag::new(k.clone(), v.clone())).collect();
            let mut shuffled = tags.clone();
            let len = shuffled.len();
            if len > 1 {
                #[allow(clippy::cast_possible_truncation)]
                shuffled.rotate_left((seed % len as u64) as usize);
                shuffled.reverse();
            }
            let a = MetricId::new("m", tags);
            let b = MetricId::new("m", shuffled);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(hash_of(&a), hash_of(&b));
        }
    }
}
