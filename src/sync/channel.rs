//! Push channel contract and the messages that cross it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::key_path::KeyPath;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("push channel is disconnected")]
    Disconnected,
    #[error("push channel error: {0}")]
    Channel(String),
}

/// Control messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Subscribe to pushes for an address
    Sync { address: String },
    /// Drop the subscription
    Unsync { address: String },
    /// Ask for the authoritative current state of an address
    Resync { address: String },
}

impl ChannelMessage {
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Sync { address } | Self::Unsync { address } | Self::Resync { address } => address,
        }
    }
}

/// Server-pushed changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Update {
        key_path: KeyPath,
        doc: Value,
    },
    Delete {
        key_path: KeyPath,
    },
    Add {
        key_path: KeyPath,
        items_key_path: KeyPath,
        item_ids: Vec<String>,
    },
    Remove {
        key_path: KeyPath,
        items_key_path: KeyPath,
        item_ids: Vec<String>,
    },
}

impl PushEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
        }
    }

    #[must_use]
    pub fn key_path(&self) -> &KeyPath {
        match self {
            Self::Update { key_path, .. }
            | Self::Delete { key_path }
            | Self::Add { key_path, .. }
            | Self::Remove { key_path, .. } => key_path,
        }
    }

    /// Registry address the event is delivered to.
    #[must_use]
    pub fn address(&self) -> String {
        self.key_path().key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Reconnect,
    Disconnect,
}

/// Duplex transport to the server.
#[async_trait]
pub trait PushChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send a control message. `Resync` answers with the current state of
    /// the address; the other messages answer `None`.
    async fn send(&self, message: ChannelMessage) -> Result<Option<Value>, SyncError>;
}
