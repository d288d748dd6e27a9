//! # Offline Sync
//!
//! An offline-first synchronization engine: a bounded local cache plus a
//! durable command queue. Clients keep working against local storage while
//! disconnected; their mutations are replayed against the remote, in order,
//! once it is reachable again.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StorageQueue                          │
//! │  • create/put/del/add/remove: local first, then logged      │
//! │  • find/fetch: local snapshot, background revalidation      │
//! └─────────────────────────────────────────────────────────────┘
//!            │ local writes + durable log          │ replay (FIFO,
//!            ▼                                     ▼  single-flight)
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │  LocalStorage                │   │  remote Storage          │
//! │  • links cid ↔ server id     │   │  (any backend)           │
//! │  • membership in-sync flags  │   └──────────────────────────┘
//! └──────────────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │  PersistentCache             │   │  SyncManager             │
//! │  • byte-bounded LRU          │   │  • push → live entities  │
//! │  • timestamped entries       │   │  • per-address refcounts │
//! └──────────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{KeyPath, OfflineSyncConfig, StorageQueue};
//! use offline_sync::cache::FileSubstrate;
//! use offline_sync::storage::local::LocalStorage;
//! use offline_sync::storage::memory::InMemoryStorage;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OfflineSyncConfig::default();
//!     let substrate = FileSubstrate::open("offline.json")?;
//!     let local = LocalStorage::open(Box::new(substrate), config.cache_max_bytes)?;
//!     let remote = InMemoryStorage::new();
//!
//!     let queue = StorageQueue::open(Arc::new(local), Some(Arc::new(remote)), &config).await?;
//!
//!     // Returns as soon as the write is local and logged
//!     let todos = KeyPath::from(["todos"]);
//!     let cid = queue.create(&todos, &json!({"text": "buy milk"})).await?;
//!     queue.put(&todos.child(&cid), &json!({"done": true})).await?;
//!
//!     let mut created = queue.events().subscribe_created();
//!     let event = created.recv().await?;
//!     println!("{} is now {}", event.cid, event.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`queue`]: the [`StorageQueue`], its commands and events
//! - [`cache`]: [`PersistentCache`](cache::PersistentCache) and its substrates
//! - [`storage`]: the [`Storage`] contract, local and in-memory backends
//! - [`sync`]: the [`SyncManager`] push bridge
//! - [`resilience`]: replay retry policy
//! - [`config`]: [`OfflineSyncConfig`]

pub mod config;
pub mod key_path;
pub mod cache;
pub mod storage;
pub mod queue;
pub mod sync;
pub mod resilience;
pub mod metrics;

pub use config::OfflineSyncConfig;
pub use key_path::KeyPath;
pub use cache::{FileSubstrate, KvSubstrate, MemorySubstrate, PersistentCache};
pub use storage::traits::{Storage, StorageError};
pub use storage::query::{FindOptions, Query, SetOptions};
pub use queue::{
    CreatedEvent, DeletedEvent, QueueCommand, QueueError, ResyncEvent, StalledEvent, StorageQueue,
    SyncedEvent,
};
pub use sync::{ChannelMessage, ConnectionEvent, Origin, PushChannel, PushEvent, SyncError, SyncManager, Syncable};
pub use resilience::retry::RetryConfig;
