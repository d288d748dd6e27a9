//! Stale-while-revalidate reconciliation with the remote.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::events::ResyncEvent;
use super::reconcile::{diff, same_content, strip_sync_marker, CollectionDiff};
use super::{QueueError, QueueInner};
use crate::key_path::KeyPath;
use crate::metrics;
use crate::storage::query::{FindOptions, Query, SetOptions};
use crate::storage::{doc_id, PERSISTED_FIELD};

/// Where the documents of a collection are stored. Top-level collections
/// hold their own documents; sub-collections point into the bucket named
/// by their last segment (`users@u1@todos` → `todos`).
pub(crate) fn items_key_path_for(collection: &KeyPath) -> KeyPath {
    match collection.segments() {
        [.., last] if collection.len() > 1 => KeyPath::new(vec![last.clone()]),
        _ => collection.clone(),
    }
}

fn mark_persisted(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert(PERSISTED_FIELD.to_string(), Value::Bool(true));
    }
    doc
}

impl QueueInner {
    /// Query the remote for a collection and fold the answer into local
    /// storage. `local_docs` is what the local find returned (empty on a
    /// miss).
    pub(super) async fn revalidate_collection(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: &FindOptions,
        local_docs: Vec<Value>,
    ) -> Result<ResyncEvent, QueueError> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(ResyncEvent {
                key_path: key_path.clone(),
                items: local_docs.into_iter().map(strip_sync_marker).collect(),
                added: Vec::new(),
                removed: Vec::new(),
                updated: Vec::new(),
            });
        };

        let remote_opts = FindOptions { local_only: false, ..opts.clone() };
        let remote_docs: Vec<Value> = match remote.find(key_path, query, &remote_opts).await {
            Ok(docs) => docs.iter().map(mark_persisted).collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                metrics::record_operation("remote", "find", "error");
                return Err(QueueError::Remote(e));
            }
        };
        metrics::record_operation("remote", "find", "success");

        // A filtered or paginated answer says nothing about what is missing
        let complete = query.is_empty() && opts.offset == 0 && opts.limit.is_none();
        let delta = diff(&local_docs, &remote_docs, complete);
        let items_key_path = items_key_path_for(key_path);

        {
            let _guard = self.write_lock.lock().await;
            for doc in delta.added.iter().chain(delta.updated.iter()) {
                let Some(id) = doc_id(doc) else { continue };
                let item = items_key_path.child(id);
                if let Err(e) = self.local.replace(&item, doc).await {
                    warn!(key_path = %item, error = %e, "Failed to store remote document");
                    continue;
                }
                if let Err(e) = self
                    .local
                    .add(key_path, &items_key_path, &[id.to_string()], &SetOptions::in_sync())
                    .await
                {
                    warn!(key_path = %key_path, id, error = %e, "Failed to record membership");
                }
            }
            let removed_ids = CollectionDiff::ids(&delta.removed);
            if !removed_ids.is_empty() {
                if let Err(e) = self
                    .local
                    .remove(key_path, &items_key_path, &removed_ids, &SetOptions::default())
                    .await
                {
                    warn!(key_path = %key_path, error = %e, "Failed to drop removed members");
                }
            }
        }

        let event = ResyncEvent {
            key_path: key_path.clone(),
            items: delta.items,
            added: CollectionDiff::ids(&delta.added),
            removed: CollectionDiff::ids(&delta.removed),
            updated: CollectionDiff::ids(&delta.updated),
        };
        self.publish_resync(&event);
        Ok(event)
    }

    /// Re-read one document from the remote. `local` is the current local
    /// copy, if any.
    pub(super) async fn revalidate_document(
        &self,
        key_path: &KeyPath,
        local: Option<Value>,
    ) -> Result<ResyncEvent, QueueError> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(ResyncEvent {
                key_path: key_path.clone(),
                items: local.into_iter().collect(),
                added: Vec::new(),
                removed: Vec::new(),
                updated: Vec::new(),
            });
        };

        // A record created under a client id is known remotely by its server id
        let remote_path = match (local.as_ref().and_then(doc_id), key_path.parent()) {
            (Some(id), Some(parent)) if key_path.id() != Some(id) => parent.child(id),
            _ => key_path.clone(),
        };
        let id = remote_path.id().unwrap_or_default().to_string();

        let mut event = ResyncEvent {
            key_path: remote_path.clone(),
            items: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            updated: Vec::new(),
        };

        match remote.fetch(&remote_path).await {
            Ok(doc) => {
                metrics::record_operation("remote", "fetch", "success");
                let changed = local.as_ref().map_or(true, |l| !same_content(l, &doc));
                if changed {
                    let _guard = self.write_lock.lock().await;
                    if let Err(e) = self.local.replace(key_path, &mark_persisted(&doc)).await {
                        warn!(key_path = %key_path, error = %e, "Failed to store remote document");
                    }
                    if local.is_some() {
                        event.updated.push(id);
                    } else {
                        event.added.push(id);
                    }
                }
                event.items.push(mark_persisted(&doc));
            }
            Err(e) if e.is_not_found() => {
                metrics::record_operation("remote", "fetch", "not_found");
                if local.is_none() {
                    return Err(QueueError::Remote(e));
                }
                let _guard = self.write_lock.lock().await;
                if let Err(e) = self.local.del(key_path).await {
                    warn!(key_path = %key_path, error = %e, "Failed to drop document gone remotely");
                }
                event.removed.push(id);
            }
            Err(e) => {
                metrics::record_operation("remote", "fetch", "error");
                return Err(QueueError::Remote(e));
            }
        }

        self.publish_resync(&event);
        Ok(event)
    }

    fn publish_resync(&self, event: &ResyncEvent) {
        metrics::record_resync(event.added.len(), event.removed.len(), event.updated.len());
        if event.has_changes() {
            info!(
                key_path = %event.key_path,
                added = event.added.len(),
                removed = event.removed.len(),
                updated = event.updated.len(),
                "Resynced with remote"
            );
        } else {
            debug!(key_path = %event.key_path, "Remote unchanged");
        }
        self.events.emit_resync(event.clone());
    }
}
