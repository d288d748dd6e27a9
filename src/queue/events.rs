//! Typed reconciliation events.
//!
//! One broadcast channel per category. Receivers that fall behind lose the
//! oldest events (`RecvError::Lagged`); emitting with no receivers is a no-op.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::key_path::KeyPath;
use super::command::QueueCommand;

/// A create was confirmed and its client id now has a server id.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEvent {
    pub key_path: KeyPath,
    pub cid: String,
    pub id: String,
}

/// Result of a revalidation against the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncEvent {
    pub key_path: KeyPath,
    /// Reconciled set (remote items plus local items still pending)
    pub items: Vec<Value>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ResyncEvent {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

/// A command was confirmed by the remote and removed from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEvent {
    pub command: QueueCommand,
    pub remaining: usize,
}

/// A delete was confirmed by the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedEvent {
    pub key_path: KeyPath,
}

/// The drain loop gave up on the head command for now.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledEvent {
    pub command: QueueCommand,
    pub attempts: usize,
    pub error: String,
}

pub struct QueueEvents {
    created: broadcast::Sender<CreatedEvent>,
    resync: broadcast::Sender<ResyncEvent>,
    synced: broadcast::Sender<SyncedEvent>,
    deleted: broadcast::Sender<DeletedEvent>,
    stalled: broadcast::Sender<StalledEvent>,
}

impl QueueEvents {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            created: broadcast::channel(capacity).0,
            resync: broadcast::channel(capacity).0,
            synced: broadcast::channel(capacity).0,
            deleted: broadcast::channel(capacity).0,
            stalled: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_created(&self) -> broadcast::Receiver<CreatedEvent> {
        self.created.subscribe()
    }

    pub fn subscribe_resync(&self) -> broadcast::Receiver<ResyncEvent> {
        self.resync.subscribe()
    }

    pub fn subscribe_synced(&self) -> broadcast::Receiver<SyncedEvent> {
        self.synced.subscribe()
    }

    pub fn subscribe_deleted(&self) -> broadcast::Receiver<DeletedEvent> {
        self.deleted.subscribe()
    }

    pub fn subscribe_stalled(&self) -> broadcast::Receiver<StalledEvent> {
        self.stalled.subscribe()
    }

    pub(crate) fn emit_created(&self, event: CreatedEvent) {
        let _ = self.created.send(event);
    }

    pub(crate) fn emit_resync(&self, event: ResyncEvent) {
        let _ = self.resync.send(event);
    }

    pub(crate) fn emit_synced(&self, event: SyncedEvent) {
        let _ = self.synced.send(event);
    }

    pub(crate) fn emit_deleted(&self, event: DeletedEvent) {
        let _ = self.deleted.send(event);
    }

    pub(crate) fn emit_stalled(&self, event: StalledEvent) {
        let _ = self.stalled.send(event);
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
