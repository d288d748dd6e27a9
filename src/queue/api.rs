// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public read/write API of the storage queue.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use super::command::QueueCommand;
use super::reconcile::strip_sync_marker;
use super::{QueueError, QueueInner, StorageQueue};
use crate::key_path::KeyPath;
use crate::metrics;
use crate::storage::query::{FindOptions, Query, SetOptions};
use crate::storage::traits::StorageError;
use crate::storage::{CID_FIELD, PERSISTED_FIELD};

impl StorageQueue {
    /// Create a document in the collection at `key_path`.
    ///
    /// Returns the client id assigned locally. Once the remote confirms,
    /// a [`CreatedEvent`](super::CreatedEvent) carries the server id and
    /// both ids resolve to the same local record.
    pub async fn create(&self, key_path: &KeyPath, doc: &Value) -> Result<String, QueueError> {
        let (key_path, doc) = (key_path.clone(), doc.clone());
        let cid = self
            .detached(move |inner| async move {
                inner
                    .logged("create", inner.local.create(&key_path, &doc), |cid: &String| {
                        let mut args = doc.clone();
                        if let Some(obj) = args.as_object_mut() {
                            obj.insert(CID_FIELD.to_string(), Value::String(cid.clone()));
                        }
                        QueueCommand::Create { key_path: key_path.clone(), args }
                    })
                    .await
            })
            .await?;
        self.synchronize();
        Ok(cid)
    }

    /// Merge `doc` into the document at `key_path` (creating it if absent).
    pub async fn put(&self, key_path: &KeyPath, doc: &Value) -> Result<(), QueueError> {
        let (key_path, doc) = (key_path.clone(), doc.clone());
        self.detached(move |inner| async move {
            inner
                .logged("update", inner.local.put(&key_path, &doc), |_| QueueCommand::Update {
                    key_path: key_path.clone(),
                    args: doc.clone(),
                })
                .await
        })
        .await?;
        self.synchronize();
        Ok(())
    }

    pub async fn del(&self, key_path: &KeyPath) -> Result<(), QueueError> {
        let key_path = key_path.clone();
        self.detached(move |inner| async move {
            inner
                .logged("delete", inner.local.del(&key_path), |_| QueueCommand::Delete {
                    key_path: key_path.clone(),
                })
                .await
        })
        .await?;
        self.synchronize();
        Ok(())
    }

    /// Add items (stored under `items_key_path`) to the collection at
    /// `key_path`.
    pub async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
    ) -> Result<(), QueueError> {
        let (key_path, items_key_path, item_ids) = (key_path.clone(), items_key_path.clone(), item_ids.to_vec());
        self.detached(move |inner| async move {
            let options = SetOptions::default();
            let write = inner.local.add(&key_path, &items_key_path, &item_ids, &options);
            inner
                .logged("add", write, |_| QueueCommand::Add {
                    key_path: key_path.clone(),
                    items_key_path: items_key_path.clone(),
                    item_ids: item_ids.clone(),
                })
                .await
        })
        .await?;
        self.synchronize();
        Ok(())
    }

    pub async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
    ) -> Result<(), QueueError> {
        let (key_path, items_key_path, item_ids) = (key_path.clone(), items_key_path.clone(), item_ids.to_vec());
        self.detached(move |inner| async move {
            let options = SetOptions::default();
            let write = inner.local.remove(&key_path, &items_key_path, &item_ids, &options);
            inner
                .logged("remove", write, |_| QueueCommand::Remove {
                    key_path: key_path.clone(),
                    items_key_path: items_key_path.clone(),
                    item_ids: item_ids.clone(),
                })
                .await
        })
        .await?;
        self.synchronize();
        Ok(())
    }

    /// Run a mutation on its own task. A caller that stops waiting cannot
    /// leave a local write without its log entry or a transaction open.
    async fn detached<T, F, Fut>(&self, mutation: F) -> Result<T, QueueError>
    where
        F: FnOnce(Arc<QueueInner>) -> Fut,
        Fut: Future<Output = Result<T, QueueError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(mutation(self.inner.clone()))
            .await
            .map_err(|e| QueueError::Local(StorageError::Backend(format!("mutation task failed: {}", e))))?
    }

    /// Documents of the collection at `key_path`.
    ///
    /// Answers from local storage when the collection is known there and
    /// revalidates in the background (unless `opts.local_only`). A local
    /// miss waits for the remote and stores its answer.
    pub async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: &FindOptions,
    ) -> Result<Vec<Value>, QueueError> {
        self.inner.ensure_open()?;
        match self.inner.local.find(key_path, query, opts).await {
            Ok(docs) => {
                if self.use_remote() && !opts.local_only {
                    let inner = self.inner.clone();
                    let (key_path, query, opts, local_docs) =
                        (key_path.clone(), query.clone(), opts.clone(), docs.clone());
                    tokio::spawn(async move {
                        if let Err(e) = inner.revalidate_collection(&key_path, &query, &opts, local_docs).await {
                            warn!(key_path = %key_path, error = %e, "Background revalidation failed");
                        }
                    });
                }
                Ok(docs.into_iter().map(strip_sync_marker).collect())
            }
            Err(e) if e.is_not_found() => {
                if !self.use_remote() || opts.local_only {
                    return Ok(Vec::new());
                }
                debug!(key_path = %key_path, "Local miss, waiting for remote");
                let event = self.inner.revalidate_collection(key_path, query, opts, Vec::new()).await?;
                Ok(event.items)
            }
            Err(e) => Err(QueueError::Local(e)),
        }
    }

    /// The document at `key_path`, following the same local-first pattern
    /// as [`find`](Self::find). Documents that were never confirmed by the
    /// remote are not revalidated.
    pub async fn fetch(&self, key_path: &KeyPath) -> Result<Value, QueueError> {
        self.inner.ensure_open()?;
        match self.inner.local.fetch(key_path).await {
            Ok(doc) => {
                if self.use_remote() && is_persisted(&doc) {
                    let inner = self.inner.clone();
                    let (key_path, local_doc) = (key_path.clone(), doc.clone());
                    tokio::spawn(async move {
                        if let Err(e) = inner.revalidate_document(&key_path, Some(local_doc)).await {
                            warn!(key_path = %key_path, error = %e, "Background revalidation failed");
                        }
                    });
                }
                Ok(doc)
            }
            Err(e) if (e.is_not_found() || matches!(e, StorageError::InvalidKey(_))) && self.use_remote() => {
                if !e.is_not_found() {
                    warn!(key_path = %key_path, error = %e, "Broken local link, reading remote");
                }
                let event = self.inner.revalidate_document(key_path, None).await?;
                event
                    .items
                    .into_iter()
                    .next()
                    .ok_or_else(|| QueueError::Remote(StorageError::NotFound(key_path.key())))
            }
            Err(e) => Err(QueueError::Local(e)),
        }
    }
}

impl QueueInner {
    /// Apply a local mutation and append its command to the log as one
    /// local transaction. If either step fails both are undone and nothing
    /// is queued.
    pub(super) async fn logged<T>(
        &self,
        command: &'static str,
        write: impl Future<Output = Result<T, StorageError>>,
        to_command: impl FnOnce(&T) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_open()?;
        self.local.begin().await.map_err(QueueError::Local)?;

        let outcome = match self.local_write(command, write).await {
            Ok(value) => self.append(to_command(&value)).await.map(|()| value),
            Err(e) => Err(e),
        };
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                self.undo(command).await;
                return Err(e);
            }
        };

        if let Err(e) = self.local.commit().await {
            self.undo(command).await;
            return Err(QueueError::Local(e));
        }
        Ok(value)
    }

    async fn undo(&self, command: &'static str) {
        match self.local.rollback().await {
            Ok(()) => debug!(command, "Rolled back local write"),
            Err(e) => error!(command, error = %e, "Failed to roll back local write"),
        }
    }

    /// Await a local mutation, recording its outcome.
    pub(super) async fn local_write<T>(
        &self,
        command: &'static str,
        write: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, QueueError> {
        match write.await {
            Ok(value) => {
                metrics::record_operation("local", command, "success");
                Ok(value)
            }
            Err(e) => {
                metrics::record_operation("local", command, "error");
                warn!(command, error = %e, "Local write failed, nothing queued");
                Err(QueueError::Local(e))
            }
        }
    }

    /// Append `command` to the durable log. Local-only queues log nothing.
    /// Caller holds the write lock and an open local transaction.
    pub(super) async fn append(&self, mut command: QueueCommand) -> Result<(), QueueError> {
        if self.remote.is_none() {
            return Ok(());
        }
        {
            let id_map = self.id_map.lock();
            for (cid, id) in id_map.iter() {
                command.remap_id(cid, id);
            }
        }
        let raw = serde_json::to_value(&command).map_err(|e| QueueError::Local(e.into()))?;
        self.local.insert(&self.log, None, &raw).await.map_err(|e| {
            warn!(command = command.name(), error = %e, "Failed to append to queue log");
            QueueError::Local(e)
        })?;
        debug!(command = command.name(), key_path = %command.key_path(), "Queued command");
        Ok(())
    }
}

pub(super) fn is_persisted(doc: &Value) -> bool {
    doc.get(PERSISTED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}
