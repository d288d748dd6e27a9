// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hierarchical addresses.
//!
//! A [`KeyPath`] is an ordered list of segments addressing a location in a
//! bucket/id space:
//!
//! ```text
//! ["todos"]                      collection (odd length)
//! ["todos", "s1"]                document   (even length)
//! ["users", "u1", "todos"]       sub-collection of a document
//! ```
//!
//! # Example
//!
//! ```
//! use offline_sync::KeyPath;
//!
//! let todos = KeyPath::from(["todos"]);
//! let doc = todos.child("c1");
//!
//! assert!(todos.is_collection());
//! assert_eq!(doc.key(), "todos@c1");
//! assert_eq!(doc.id(), Some("c1"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when a key path is flattened into a storage key.
pub const KEY_SEPARATOR: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Flattened storage key (`"todos@c1"`).
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = String::new();
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(segment);
        }
        key
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collections have an odd number of segments.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.0.len() % 2 == 1
    }

    /// Key path of a document inside this collection.
    #[must_use]
    pub fn child(&self, id: &str) -> KeyPath {
        let mut segments = self.0.clone();
        segments.push(id.to_string());
        KeyPath(segments)
    }

    /// Key path without its last segment.
    #[must_use]
    pub fn parent(&self) -> Option<KeyPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(KeyPath(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Last segment of a document key path.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        if self.is_collection() {
            return None;
        }
        self.0.last().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, segment: &str) -> bool {
        self.0.iter().any(|s| s == segment)
    }

    /// Replace every segment equal to `old` with `new`. Returns whether
    /// anything changed.
    pub fn replace_segment(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        for segment in self.0.iter_mut().filter(|s| s.as_str() == old) {
            *segment = new.to_string();
            changed = true;
        }
        changed
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(segments: [&str; N]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for KeyPath {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}
