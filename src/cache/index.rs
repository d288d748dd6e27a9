// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recency index for the persistent cache.
//!
//! A circular doubly linked list embedded in a growable slot array:
//!
//! ```text
//!            first (MRU)                  last (LRU)
//!   ┌──────┐ next ┌──────┐ next ┌──────┐ next ┌──────┐
//!   │ 0    │ ───▶ │ "c"  │ ───▶ │ "b"  │ ───▶ │ "a"  │ ──▶ back to 0
//!   │ sent │ ◀─── │      │ ◀─── │      │ ◀─── │      │
//!   └──────┘ prev └──────┘ prev └──────┘ prev └──────┘
//! ```
//!
//! Slot 0 is the sentinel and never holds a key. Freed slots go on a free
//! list and are reused before the array grows.

/// Sentinel slot.
pub const SENTINEL: usize = 0;

#[derive(Debug, Clone)]
struct Slot {
    key: Option<String>,
    prev: usize,
    next: usize,
}

#[derive(Debug, Clone)]
pub struct Index {
    slots: Vec<Slot>,
    free: Vec<usize>,
    len: usize,
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                key: None,
                prev: SENTINEL,
                next: SENTINEL,
            }],
            free: Vec::new(),
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Most recently used slot, `None` when empty.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        Some(self.slots[SENTINEL].next).filter(|&s| s != SENTINEL)
    }

    /// Least recently used slot, `None` when empty.
    #[must_use]
    pub fn last(&self) -> Option<usize> {
        Some(self.slots[SENTINEL].prev).filter(|&s| s != SENTINEL)
    }

    #[must_use]
    pub fn key(&self, slot: usize) -> Option<&str> {
        self.slots.get(slot).and_then(|s| s.key.as_deref())
    }

    /// Insert `key` as most recently used and return its slot.
    pub fn push_front(&mut self, key: String) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].key = Some(key);
                slot
            }
            None => {
                self.slots.push(Slot {
                    key: Some(key),
                    prev: SENTINEL,
                    next: SENTINEL,
                });
                self.slots.len() - 1
            }
        };
        self.link_front(slot);
        self.len += 1;
        slot
    }

    /// Move an occupied slot to the most recently used position.
    pub fn touch(&mut self, slot: usize) {
        if slot == SENTINEL || self.slots[SENTINEL].next == slot {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    /// Free a slot and return the key it held.
    pub fn remove(&mut self, slot: usize) -> Option<String> {
        if slot == SENTINEL {
            return None;
        }
        let key = self.slots.get_mut(slot)?.key.take()?;
        self.unlink(slot);
        self.free.push(slot);
        self.len -= 1;
        Some(key)
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Slots from least to most recently used.
    pub fn iter_lru(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.slots[SENTINEL].prev;
        std::iter::from_fn(move || {
            if cursor == SENTINEL {
                return None;
            }
            let slot = cursor;
            cursor = self.slots[slot].prev;
            Some(slot)
        })
    }

    fn link_front(&mut self, slot: usize) {
        let old_first = self.slots[SENTINEL].next;
        self.slots[slot].prev = SENTINEL;
        self.slots[slot].next = old_first;
        self.slots[old_first].prev = slot;
        self.slots[SENTINEL].next = slot;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        self.slots[slot].prev = SENTINEL;
        self.slots[slot].next = SENTINEL;
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}
