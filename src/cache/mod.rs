// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded local cache.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Cache Module                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  persistent.rs  - PersistentCache: byte-bounded LRU          │
//! │  └─ set_item plans victims first, no partial writes          │
//! │  └─ populate(): recency rebuilt from entry timestamps        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  index.rs       - slot-array linked list, sentinel slot 0    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  substrate.rs   - raw KV stores: memory, JSON file           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod index;
pub mod persistent;
pub mod substrate;

pub use index::Index;
pub use persistent::PersistentCache;
pub use substrate::{FileSubstrate, KvSubstrate, MemorySubstrate};
