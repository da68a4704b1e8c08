//! Metric dimensions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A key/value pair attached to a measurement.
///
/// Two tags with the same key and different values are different
/// dimensions. Values are opaque strings: `"1"` and `"01"` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Create a new tag. An empty key is accepted here and rejected when the
    /// tag reaches a write, see [`Error::InvalidTag`].
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a new tag, rejecting an empty key immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTag`] if `key` is empty.
    pub fn try_new<K, V>(key: K, value: V) -> Result<Self, Error>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let tag = Self::new(key, value);
        tag.validate()?;
        Ok(tag)
    }

    /// The tag key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tag value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.key.is_empty() {
            return Err(Error::InvalidTag {
                value: self.value.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Tag
where
    K: Into<String>,
    V: Into<String>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}
