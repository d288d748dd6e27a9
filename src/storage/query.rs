//! Query and option types for collection operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field-equality filter applied to collection members.
///
/// An empty query matches every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.0.insert(field.to_string(), value);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Skip this many matching documents
    #[serde(default)]
    pub offset: usize,
    /// Return at most this many documents
    #[serde(default)]
    pub limit: Option<usize>,
    /// Only consult the local backend (no revalidation)
    #[serde(default)]
    pub local_only: bool,
}

impl FindOptions {
    /// Apply offset/limit to an already filtered result set.
    pub fn paginate(&self, docs: Vec<Value>) -> Vec<Value> {
        let iter = docs.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Options for `add`/`remove` on a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOptions {
    /// Membership is already known to the server (set by reconciliation
    /// and by confirmed replays). Ignored by remote backends.
    #[serde(default)]
    pub in_sync: bool,
}

impl SetOptions {
    #[must_use]
    pub fn in_sync() -> Self {
        Self { in_sync: true }
    }
}
