// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded LRU cache over a persistent substrate.
//!
//! Values are pre-serialized strings. Each entry is persisted as
//! `"<unixMillisTimestamp>|<value>"`; on open the recency order is rebuilt
//! purely from those timestamps. Reads are side-effecting: `get_item` moves
//! the key to the head of the recency order and re-stamps the entry.
//!
//! # Example
//!
//! ```
//! use offline_sync::cache::{MemorySubstrate, PersistentCache};
//!
//! let mut cache = PersistentCache::open(MemorySubstrate::new(), 10).unwrap();
//! assert!(cache.set_item("a", "12345").unwrap());
//! assert!(cache.set_item("b", "12345").unwrap());
//! assert!(cache.set_item("c", "1").unwrap()); // evicts "a"
//!
//! assert_eq!(cache.keys(), vec!["b", "c"]);
//! assert_eq!(cache.size(), 6);
//! assert!(!cache.set_item("huge", "0123456789ab").unwrap()); // never fits
//! ```

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::metrics;
use crate::storage::traits::StorageError;
use super::index::Index;
use super::substrate::KvSubstrate;

const ENTRY_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    size: usize,
    slot: usize,
}

pub struct PersistentCache<S: KvSubstrate> {
    substrate: S,
    map: HashMap<String, EntryMeta>,
    index: Index,
    current_size: usize,
    max_size: usize,
    /// Keys with these prefixes count towards the size but are never evicted
    protected_prefixes: Vec<String>,
    /// Keys temporarily exempt from eviction
    pinned: HashSet<String>,
    last_timestamp: i64,
}

impl<S: KvSubstrate> PersistentCache<S> {
    /// Open the cache and rebuild its index from the substrate.
    pub fn open(substrate: S, max_size: usize) -> Result<Self, StorageError> {
        Self::open_with_protected(substrate, max_size, Vec::new())
    }

    /// Open with key prefixes that are exempt from eviction.
    pub fn open_with_protected(
        substrate: S,
        max_size: usize,
        protected_prefixes: Vec<String>,
    ) -> Result<Self, StorageError> {
        let mut cache = Self {
            substrate,
            map: HashMap::new(),
            index: Index::new(),
            current_size: 0,
            max_size,
            protected_prefixes,
            pinned: HashSet::new(),
            last_timestamp: 0,
        };
        cache.populate()?;
        Ok(cache)
    }

    /// Give the substrate back (e.g. to reopen it).
    pub fn into_substrate(self) -> S {
        self.substrate
    }

    /// Rebuild map and recency order from persisted timestamps.
    ///
    /// Entries are ordered by their recorded timestamp, oldest first. Clock
    /// skew between writers can therefore misorder entries.
    fn populate(&mut self) -> Result<(), StorageError> {
        let mut entries: Vec<(i64, String, usize)> = Vec::new();
        for key in self.substrate.keys() {
            let Some(raw) = self.substrate.get(&key) else {
                continue;
            };
            match parse_entry(&raw) {
                Some((ts, value)) => entries.push((ts, key, value.len())),
                None => warn!(key = %key, "Skipping malformed cache entry"),
            }
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (ts, key, size) in entries {
            let slot = self.index.push_front(key.clone());
            self.map.insert(key, EntryMeta { size, slot });
            self.current_size += size;
            self.last_timestamp = self.last_timestamp.max(ts);
        }

        debug!(
            entries = self.map.len(),
            bytes = self.current_size,
            max_bytes = self.max_size,
            "Cache populated"
        );

        if self.current_size > self.max_size {
            self.shrink_to_fit()?;
        }
        metrics::set_cache_bytes(self.current_size);
        Ok(())
    }

    /// Read a value and mark it most recently used.
    pub fn get_item(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        let Some(meta) = self.map.get(key).copied() else {
            return Ok(None);
        };

        let value = match self.substrate.get(key).as_deref().and_then(parse_entry) {
            Some((_, value)) => value.to_string(),
            None => {
                // Substrate lost or garbled the entry behind our back
                warn!(key = %key, "Cache entry vanished from substrate");
                self.forget(key);
                return Ok(None);
            }
        };

        self.index.touch(meta.slot);
        let ts = self.next_timestamp();
        self.substrate.set(key, &encode_entry(ts, &value))?;
        Ok(Some(value))
    }

    /// Insert or update. Returns `false` (and changes nothing) when the
    /// value cannot be made to fit.
    pub fn set_item(&mut self, key: &str, value: &str) -> Result<bool, StorageError> {
        let new_size = value.len();
        let old = self.map.get(key).copied();
        let old_size = old.map_or(0, |m| m.size);

        if new_size > self.max_size {
            debug!(key = %key, size = new_size, max_bytes = self.max_size, "Value larger than cache");
            return Ok(false);
        }

        let required = self.current_size - old_size + new_size;
        let needed = required.saturating_sub(self.max_size);
        let Some(victims) = self.plan_eviction(needed, Some(key)) else {
            debug!(key = %key, needed, "Cannot make room for value");
            return Ok(false);
        };
        self.evict(&victims)?;

        let ts = self.next_timestamp();
        self.substrate.set(key, &encode_entry(ts, value))?;

        match old {
            Some(meta) => {
                self.index.touch(meta.slot);
                self.map.insert(key.to_string(), EntryMeta { size: new_size, slot: meta.slot });
            }
            None => {
                let slot = self.index.push_front(key.to_string());
                self.map.insert(key.to_string(), EntryMeta { size: new_size, slot });
            }
        }
        self.current_size = self.current_size - old_size + new_size;
        metrics::set_cache_bytes(self.current_size);
        Ok(true)
    }

    /// Read a value without touching recency.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        if !self.map.contains_key(key) {
            return None;
        }
        let raw = self.substrate.get(key)?;
        parse_entry(&raw).map(|(_, value)| value.to_string())
    }

    /// Keep `key` out of eviction until [`unpin_all`](Self::unpin_all).
    /// A write that could only fit by evicting pinned keys is refused.
    pub fn pin(&mut self, key: &str) {
        self.pinned.insert(key.to_string());
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove_item(&mut self, key: &str) -> Result<bool, StorageError> {
        if !self.map.contains_key(key) {
            return Ok(false);
        }
        self.substrate.remove(key)?;
        self.forget(key);
        metrics::set_cache_bytes(self.current_size);
        Ok(true)
    }

    /// Remove every entry the cache tracks.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        for key in self.map.keys() {
            self.substrate.remove(key)?;
        }
        self.map.clear();
        self.index.clear();
        self.current_size = 0;
        metrics::set_cache_bytes(0);
        Ok(())
    }

    /// Visit entries from least to most recently used. Does not touch recency.
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &str),
    {
        for slot in self.index.iter_lru() {
            let Some(key) = self.index.key(slot) else {
                continue;
            };
            if let Some(raw) = self.substrate.get(key) {
                if let Some((_, value)) = parse_entry(&raw) {
                    f(key, value);
                }
            }
        }
    }

    /// Keys from least to most recently used.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.index
            .iter_lru()
            .filter_map(|slot| self.index.key(slot).map(str::to_string))
            .collect()
    }

    /// Change the byte budget, evicting down to it if necessary.
    pub fn set_max_size(&mut self, max_size: usize) -> Result<(), StorageError> {
        self.max_size = max_size;
        if self.current_size > self.max_size {
            self.shrink_to_fit()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.current_size
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn is_protected(&self, key: &str) -> bool {
        self.protected_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Pick least recently used victims freeing at least `bytes` without
    /// touching anything. `None` if that is impossible.
    fn plan_eviction(&self, bytes: usize, exclude: Option<&str>) -> Option<Vec<String>> {
        if bytes == 0 {
            return Some(Vec::new());
        }
        let mut freed = 0;
        let mut victims = Vec::new();
        for slot in self.index.iter_lru() {
            let Some(key) = self.index.key(slot) else {
                continue;
            };
            if Some(key) == exclude || self.is_protected(key) || self.pinned.contains(key) {
                continue;
            }
            freed += self.map.get(key).map_or(0, |m| m.size);
            victims.push(key.to_string());
            if freed >= bytes {
                return Some(victims);
            }
        }
        None
    }

    fn evict(&mut self, victims: &[String]) -> Result<(), StorageError> {
        if victims.is_empty() {
            return Ok(());
        }
        let mut bytes = 0;
        for key in victims {
            self.substrate.remove(key)?;
            bytes += self.forget(key);
            debug!(key = %key, "Evicted cache entry");
        }
        metrics::record_eviction(victims.len(), bytes);
        Ok(())
    }

    /// Evict until within budget; protected entries may keep it over.
    fn shrink_to_fit(&mut self) -> Result<(), StorageError> {
        let excess = self.current_size.saturating_sub(self.max_size);
        let victims = match self.plan_eviction(excess, None) {
            Some(victims) => victims,
            None => {
                warn!(
                    bytes = self.current_size,
                    max_bytes = self.max_size,
                    "Protected entries exceed cache budget"
                );
                self.keys().into_iter().filter(|k| !self.is_protected(k)).collect()
            }
        };
        self.evict(&victims)?;
        metrics::set_cache_bytes(self.current_size);
        Ok(())
    }

    /// Drop bookkeeping for a key. Returns the bytes released.
    fn forget(&mut self, key: &str) -> usize {
        match self.map.remove(key) {
            Some(meta) => {
                self.index.remove(meta.slot);
                self.current_size -= meta.size;
                meta.size
            }
            None => 0,
        }
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }
}

/// Split `"<ts>|<value>"`.
pub fn parse_entry(raw: &str) -> Option<(i64, &str)> {
    let (ts, value) = raw.split_once(ENTRY_SEPARATOR)?;
    Some((ts.parse().ok()?, value))
}

pub fn encode_entry(ts: i64, value: &str) -> String {
    format!("{}{}{}", ts, ENTRY_SEPARATOR, value)
}
