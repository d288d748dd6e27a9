// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay of the durable log against the remote.
//!
//! At most one drain task runs per queue. It takes the head command,
//! retries it with backoff until the remote accepts it, confirms it
//! locally, and moves on. Nothing behind a failing head is sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::command::QueueCommand;
use super::events::{CreatedEvent, DeletedEvent, StalledEvent, SyncedEvent};
use super::{QueueError, QueueInner, StorageQueue};
use crate::key_path::KeyPath;
use crate::metrics;
use crate::resilience::retry::{retry, RetryError};
use crate::storage::query::SetOptions;
use crate::storage::traits::{Storage, StorageError};
use crate::storage::{ID_FIELD, PERSISTED_FIELD};

/// Clears the draining flag however the drain pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StorageQueue {
    /// Make sure the log is being drained.
    ///
    /// Idempotent: if a drain task is already running it picks up new
    /// commands on its own. Also resumes a queue that stalled.
    pub fn synchronize(&self) {
        if !self.use_remote() || self.is_closed() {
            return;
        }
        self.inner.kicked.store(true, Ordering::SeqCst);
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(inner.drain());
    }
}

impl QueueInner {
    async fn drain(self: Arc<Self>) {
        loop {
            self.kicked.store(false, Ordering::SeqCst);
            {
                let _guard = DrainGuard(&self.draining);
                self.drain_until_idle().await;
            }
            // A kick that raced with the end of the pass would otherwise be lost
            if !self.kicked.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
                break;
            }
            if self.draining.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    async fn drain_until_idle(&self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };

        loop {
            if self.shutdown.is_cancelled() {
                debug!("Drain stopped: queue closed");
                return;
            }

            let head = match self.local.first(&self.log).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    metrics::set_queue_depth(0);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Cannot read queue head");
                    return;
                }
            };

            let command: QueueCommand = match serde_json::from_value(head) {
                Ok(command) => command,
                Err(e) => {
                    error!(error = %e, "Dropping undecodable queue head");
                    let _guard = self.write_lock.lock().await;
                    if let Err(e) = self.local.extract(&self.log, 0).await {
                        error!(error = %e, "Cannot drop queue head");
                        return;
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let result = retry(command.name(), &self.retry, &self.shutdown, || {
                dispatch(&*remote, &command)
            })
            .await;

            match result {
                Ok(server_id) => {
                    metrics::record_operation("remote", command.name(), "success");
                    metrics::record_replay_latency(command.name(), started.elapsed());
                    if let Err(e) = self.confirm(command, server_id).await {
                        error!(error = %e, "Failed to confirm replayed command");
                        return;
                    }
                }
                Err(RetryError::Cancelled) => {
                    debug!(command = command.name(), "Replay cancelled");
                    return;
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    metrics::record_operation("remote", command.name(), "error");
                    metrics::record_stall(command.name());
                    warn!(
                        command = command.name(),
                        key_path = %command.key_path(),
                        attempts,
                        error = %last,
                        "Queue stalled on head command"
                    );
                    self.events.emit_stalled(StalledEvent {
                        command,
                        attempts,
                        error: last.to_string(),
                    });
                    return;
                }
            }

            tokio::task::yield_now().await;
        }
    }

    /// Pop the confirmed head and apply its local consequences.
    async fn confirm(&self, command: QueueCommand, server_id: Option<String>) -> Result<(), QueueError> {
        {
            let _guard = self.write_lock.lock().await;
            self.local.extract(&self.log, 0).await.map_err(QueueError::Local)?;
        }

        match &command {
            QueueCommand::Create { key_path, .. } => {
                if let (Some(cid), Some(id)) = (command.cid(), server_id.as_deref()) {
                    self.remap_created(key_path, cid, id).await?;
                }
            }
            QueueCommand::Add { key_path, items_key_path, item_ids } => {
                self.mark_in_sync(key_path, items_key_path, item_ids).await;
            }
            QueueCommand::Delete { key_path } => {
                self.events.emit_deleted(DeletedEvent { key_path: key_path.clone() });
            }
            QueueCommand::Update { .. } | QueueCommand::Remove { .. } => {}
        }

        let remaining = self.local.all(&self.log).await.map_err(QueueError::Local)?.len();
        metrics::set_queue_depth(remaining);
        debug!(command = command.name(), key_path = %command.key_path(), remaining, "Replayed command");
        self.events.emit_synced(SyncedEvent { command, remaining });
        Ok(())
    }

    /// Record the server id of a confirmed create and rewrite every queued
    /// reference to the client id.
    async fn remap_created(&self, key_path: &KeyPath, cid: &str, id: &str) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let cid_path = key_path.child(cid);

        match self.local.fetch(&cid_path).await {
            Ok(_) => {
                let marker = json!({ ID_FIELD: id, PERSISTED_FIELD: true });
                self.local.put(&cid_path, &marker).await.map_err(QueueError::Local)?;
                if id != cid {
                    self.local.link(&key_path.child(id), &cid_path).await.map_err(QueueError::Local)?;
                }
                self.local
                    .add(key_path, key_path, &[id.to_string()], &SetOptions::in_sync())
                    .await
                    .map_err(QueueError::Local)?;
            }
            Err(e) if e.is_not_found() => {
                debug!(cid, id, "Created record already gone locally");
            }
            Err(e) => return Err(QueueError::Local(e)),
        }

        if id == cid {
            self.events.emit_created(CreatedEvent {
                key_path: key_path.clone(),
                cid: cid.to_string(),
                id: id.to_string(),
            });
            return Ok(());
        }

        self.id_map.lock().insert(cid.to_string(), id.to_string());

        let queued = self.local.all(&self.log).await.map_err(QueueError::Local)?;
        let mut rewritten = 0;
        for (index, raw) in queued.into_iter().enumerate() {
            let mut command: QueueCommand = match serde_json::from_value(raw) {
                Ok(command) => command,
                Err(_) => continue,
            };
            if command.remap_id(cid, id) {
                let raw = serde_json::to_value(&command).map_err(|e| QueueError::Local(e.into()))?;
                self.local.update_at(&self.log, index, &raw).await.map_err(QueueError::Local)?;
                rewritten += 1;
            }
        }

        metrics::record_id_remap(rewritten);
        info!(key_path = %key_path, cid, id, rewritten, "Remapped client id to server id");
        self.events.emit_created(CreatedEvent {
            key_path: key_path.clone(),
            cid: cid.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    /// Memberships the remote accepted are in sync from now on. Items that
    /// no longer exist locally are skipped.
    async fn mark_in_sync(&self, key_path: &KeyPath, items_key_path: &KeyPath, item_ids: &[String]) {
        let _guard = self.write_lock.lock().await;
        let mut present = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            if self.local.fetch(&items_key_path.child(id)).await.is_ok() {
                present.push(id.clone());
            }
        }
        if present.is_empty() {
            return;
        }
        if let Err(e) = self
            .local
            .add(key_path, items_key_path, &present, &SetOptions::in_sync())
            .await
        {
            warn!(key_path = %key_path, error = %e, "Failed to mark membership in sync");
        }
    }
}

/// Send one command to the remote. A create yields the server id.
async fn dispatch(remote: &dyn Storage, command: &QueueCommand) -> Result<Option<String>, StorageError> {
    match command {
        QueueCommand::Create { key_path, args } => remote.create(key_path, args).await.map(Some),
        QueueCommand::Update { key_path, args } => remote.put(key_path, args).await.map(|_| None),
        QueueCommand::Delete { key_path } => match remote.del(key_path).await {
            // Already gone is as good as deleted
            Err(e) if e.is_not_found() => Ok(None),
            other => other.map(|_| None),
        },
        QueueCommand::Add { key_path, items_key_path, item_ids } => remote
            .add(key_path, items_key_path, item_ids, &SetOptions::default())
            .await
            .map(|_| None),
        QueueCommand::Remove { key_path, items_key_path, item_ids } => remote
            .remove(key_path, items_key_path, item_ids, &SetOptions::default())
            .await
            .map(|_| None),
    }
}
