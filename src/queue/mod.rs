// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline-first storage queue.
//!
//! The [`StorageQueue`] fronts a local and an optional remote [`Storage`].
//! Every mutation is applied locally first, then appended to a durable
//! command log that lives in the local backend. A single drain task replays
//! the log against the remote strictly in order, one command in flight.
//!
//! ```text
//!   create/put/del/add/remove
//!            │
//!            ▼
//!   ┌────────────────┐   append   ┌──────────────────────┐
//!   │ local storage  │ ─────────► │ meta@storageQueue    │
//!   └────────────────┘            └──────────┬───────────┘
//!            ▲                               │ head, one at a time
//!            │ remap cid → id, resync        ▼
//!            └──────────────────────  remote storage
//! ```
//!
//! Reads (`find`/`fetch`) answer from local storage immediately and
//! revalidate against the remote in the background, broadcasting the
//! outcome as a [`ResyncEvent`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{KeyPath, OfflineSyncConfig, StorageQueue};
//! use offline_sync::cache::MemorySubstrate;
//! use offline_sync::storage::local::LocalStorage;
//! use offline_sync::storage::memory::InMemoryStorage;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OfflineSyncConfig::default();
//! let local = LocalStorage::open(Box::new(MemorySubstrate::new()), config.cache_max_bytes)?;
//! let remote = InMemoryStorage::with_id_prefix("s");
//!
//! let queue = StorageQueue::open(Arc::new(local), Some(Arc::new(remote)), &config).await?;
//! let mut created = queue.events().subscribe_created();
//!
//! let cid = queue.create(&KeyPath::from(["todos"]), &json!({"text": "a"})).await?;
//! let confirmed = created.recv().await?;
//! assert_eq!(confirmed.cid, cid);
//! # Ok(())
//! # }
//! ```

mod api;
mod drain;
mod revalidate;

pub mod command;
pub mod events;
pub mod reconcile;

pub use command::QueueCommand;
pub use events::{CreatedEvent, DeletedEvent, QueueEvents, ResyncEvent, StalledEvent, SyncedEvent};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::config::OfflineSyncConfig;
use crate::key_path::KeyPath;
use crate::resilience::retry::RetryConfig;
use crate::resilience::shutdown::Shutdown;
use crate::storage::traits::{Storage, StorageError};

#[derive(Error, Debug)]
pub enum QueueError {
    /// The local backend rejected the operation. Nothing was queued.
    #[error("local storage error: {0}")]
    Local(#[source] StorageError),
    /// A read that needed the remote failed.
    #[error("remote storage error: {0}")]
    Remote(#[source] StorageError),
    #[error("queue is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Offline-first queue over a local and an optional remote backend.
///
/// Cheap to clone; clones share the same log, drain task and events.
#[derive(Clone)]
pub struct StorageQueue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    local: Arc<dyn Storage>,
    remote: Option<Arc<dyn Storage>>,
    /// Address of the durable command log
    log: KeyPath,
    retry: RetryConfig,
    events: QueueEvents,
    /// Serializes local mutations with their log append and with id remaps
    write_lock: tokio::sync::Mutex<()>,
    /// Confirmed client id → server id, applied to commands as they are queued
    id_map: Mutex<HashMap<String, String>>,
    draining: AtomicBool,
    /// Set by `synchronize`, cleared by the drain task before each pass
    kicked: AtomicBool,
    /// Closes the queue and cuts short any replay backoff
    shutdown: Shutdown,
}

impl StorageQueue {
    /// Build a queue without touching storage. Use [`open`](Self::open) to
    /// also resume replay of commands left over from a previous run.
    ///
    /// With `remote = None` the queue runs local-only: mutations are not
    /// logged and reads never revalidate.
    #[must_use]
    pub fn new(
        local: Arc<dyn Storage>,
        remote: Option<Arc<dyn Storage>>,
        config: &OfflineSyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                local,
                remote,
                log: config.queue_key_path(),
                retry: config.replay_retry(),
                events: QueueEvents::new(config.event_capacity),
                write_lock: tokio::sync::Mutex::new(()),
                id_map: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
                kicked: AtomicBool::new(false),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Validate `config`, build the queue, and start draining whatever the
    /// durable log already holds.
    pub async fn open(
        local: Arc<dyn Storage>,
        remote: Option<Arc<dyn Storage>>,
        config: &OfflineSyncConfig,
    ) -> Result<Self, QueueError> {
        config.validate().map_err(QueueError::Config)?;
        let queue = Self::new(local, remote, config);

        let pending = queue.inner.local.all(&queue.inner.log).await.map_err(QueueError::Local)?;
        crate::metrics::set_queue_depth(pending.len());
        if !pending.is_empty() && queue.use_remote() {
            info!(pending = pending.len(), log = %queue.inner.log, "Resuming replay of queued commands");
            queue.synchronize();
        }
        Ok(queue)
    }

    /// Is a remote configured?
    #[must_use]
    pub fn use_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn events(&self) -> &QueueEvents {
        &self.inner.events
    }

    #[must_use]
    pub fn local(&self) -> &Arc<dyn Storage> {
        &self.inner.local
    }

    #[must_use]
    pub fn remote(&self) -> Option<&Arc<dyn Storage>> {
        self.inner.remote.as_ref()
    }

    #[must_use]
    pub fn log_key_path(&self) -> &KeyPath {
        &self.inner.log
    }

    /// Commands still waiting for the remote, head first.
    pub async fn pending(&self) -> Result<Vec<QueueCommand>, QueueError> {
        let raw = self.inner.local.all(&self.inner.log).await.map_err(QueueError::Local)?;
        raw.into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| QueueError::Local(e.into())))
            .collect()
    }

    /// Stop accepting mutations and stop the drain task, interrupting a
    /// replay backoff in progress.
    /// The durable log is left as is; a new queue over the same local
    /// storage picks it up.
    pub fn close(&self) {
        if self.inner.shutdown.cancel() {
            info!(log = %self.inner.log, "Storage queue closed");
        }
    }
}

impl QueueInner {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}
