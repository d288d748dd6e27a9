// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server push bridge.
//!
//! The [`SyncManager`] keeps a registry of live entities that opted into
//! continuous synchronization, keyed by address (the flattened key path).
//! The first subscriber of an address sends `Sync`, the last one to leave
//! sends `Unsync`. Pushes are delivered to every entity at the event's
//! address tagged [`Origin::Remote`], so entities can tell them apart from
//! their own writes.
//!
//! On connect and reconnect every tracked address is subscribed again and
//! resynced, covering whatever was pushed while the channel was down.

pub mod channel;

pub use channel::{ChannelMessage, ConnectionEvent, PushChannel, PushEvent, SyncError};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::key_path::KeyPath;
use crate::metrics;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Issued by this client (goes through the queue)
    Local,
    /// Pushed by the server (must not be written back)
    Remote,
}

/// A live entity that mirrors server state.
pub trait Syncable: Send + Sync {
    /// Stable identity; registering the same id twice is a no-op.
    fn sync_id(&self) -> String;

    fn key_path(&self) -> KeyPath;

    fn apply(&self, event: &PushEvent, origin: Origin);

    /// Replace local state with the authoritative `state`.
    fn resync(&self, state: &Value, origin: Origin);
}

type Subscribers = BTreeMap<String, Arc<dyn Syncable>>;

pub struct SyncManager {
    channel: Arc<dyn PushChannel>,
    registry: Mutex<HashMap<String, Subscribers>>,
}

impl SyncManager {
    #[must_use]
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Register `entity` for pushes at its address.
    ///
    /// While disconnected the entity is still registered (and subscribed on
    /// the next connect) but the call reports [`SyncError::Disconnected`].
    pub async fn start_sync(&self, entity: Arc<dyn Syncable>) -> Result<(), SyncError> {
        let address = entity.key_path().key();
        let first = {
            let mut registry = self.registry.lock();
            let subscribers = registry.entry(address.clone()).or_default();
            let was_empty = subscribers.is_empty();
            let added = subscribers.insert(entity.sync_id(), entity).is_none();
            metrics::set_tracked_addresses(registry.len());
            added && was_empty
        };

        if !first {
            return Ok(());
        }
        if !self.channel.is_connected() {
            debug!(address = %address, "Subscribe deferred until connected");
            return Err(SyncError::Disconnected);
        }
        self.send(ChannelMessage::Sync { address }).await.map(|_| ())
    }

    /// Drop `entity`. The last subscriber of an address unsubscribes it.
    pub async fn end_sync(&self, entity: &dyn Syncable) -> Result<(), SyncError> {
        let address = entity.key_path().key();
        let last = {
            let mut registry = self.registry.lock();
            let Some(subscribers) = registry.get_mut(&address) else {
                return Ok(());
            };
            if subscribers.remove(&entity.sync_id()).is_none() {
                return Ok(());
            }
            let last = subscribers.is_empty();
            if last {
                registry.remove(&address);
            }
            metrics::set_tracked_addresses(registry.len());
            last
        };

        // A dropped connection already took the server-side subscription with it
        if !last || !self.channel.is_connected() {
            return Ok(());
        }
        self.send(ChannelMessage::Unsync { address }).await.map(|_| ())
    }

    /// React to transport state changes. Connect and reconnect resubscribe
    /// and resync every tracked address; the first failure is returned
    /// after all addresses were attempted.
    pub async fn handle_connection(&self, event: ConnectionEvent) -> Result<(), SyncError> {
        match event {
            ConnectionEvent::Disconnect => {
                info!(tracked = self.registry.lock().len(), "Push channel disconnected");
                Ok(())
            }
            ConnectionEvent::Connect | ConnectionEvent::Reconnect => {
                let addresses: Vec<String> = self.registry.lock().keys().cloned().collect();
                info!(?event, tracked = addresses.len(), "Push channel connected, resubscribing");

                let mut first_error = None;
                for address in addresses {
                    if let Err(e) = self.resubscribe(&address).await {
                        warn!(address = %address, error = %e, "Resubscribe failed");
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Deliver a push to the entities at its address. Returns how many were
    /// notified.
    pub fn handle_push(&self, event: &PushEvent) -> usize {
        let subscribers = self.subscribers(&event.address());
        for entity in &subscribers {
            entity.apply(event, Origin::Remote);
        }
        metrics::record_push(event.kind(), subscribers.len());
        debug!(kind = event.kind(), address = %event.address(), delivered = subscribers.len(), "Push delivered");
        subscribers.len()
    }

    /// Tracked addresses with their subscriber counts.
    #[must_use]
    pub fn tracked(&self) -> Vec<(String, usize)> {
        let registry = self.registry.lock();
        let mut tracked: Vec<_> = registry.iter().map(|(a, s)| (a.clone(), s.len())).collect();
        tracked.sort();
        tracked
    }

    #[must_use]
    pub fn subscriber_count(&self, key_path: &KeyPath) -> usize {
        self.registry.lock().get(&key_path.key()).map_or(0, BTreeMap::len)
    }

    async fn resubscribe(&self, address: &str) -> Result<(), SyncError> {
        self.send(ChannelMessage::Sync { address: address.to_string() }).await?;
        let state = self.send(ChannelMessage::Resync { address: address.to_string() }).await?;
        if let Some(state) = state {
            for entity in self.subscribers(address) {
                entity.resync(&state, Origin::Remote);
            }
        }
        Ok(())
    }

    /// Snapshot, so entity callbacks run without the registry lock.
    fn subscribers(&self, address: &str) -> Vec<Arc<dyn Syncable>> {
        self.registry
            .lock()
            .get(address)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn send(&self, message: ChannelMessage) -> Result<Option<Value>, SyncError> {
        match self.channel.send(message).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                metrics::record_channel_error(&e.to_string());
                Err(e)
            }
        }
    }
}
