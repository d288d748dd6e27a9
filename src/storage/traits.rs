use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::key_path::KeyPath;
use super::query::{FindOptions, Query, SetOptions};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Invalid key '{0}': link chain ends without a value")]
    InvalidKey(String),
    #[error("Capacity exceeded writing '{key}': {size} bytes does not fit in {max_size} bytes")]
    CapacityExceeded {
        key: String,
        size: usize,
        max_size: usize,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Backend contract shared by the local and the remote side of the queue.
///
/// Documents are JSON objects. `create` returns the id the backend assigned
/// (a client id locally, a server id remotely).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create(&self, key_path: &KeyPath, doc: &Value) -> Result<String, StorageError>;
    async fn put(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError>;
    async fn fetch(&self, key_path: &KeyPath) -> Result<Value, StorageError>;
    async fn del(&self, key_path: &KeyPath) -> Result<(), StorageError>;

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &SetOptions,
    ) -> Result<(), StorageError>;

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &SetOptions,
    ) -> Result<(), StorageError>;

    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: &FindOptions,
    ) -> Result<Vec<Value>, StorageError>;

    /// Overwrite the document at `key_path` with `doc` (no merge), creating
    /// it if absent. Client-id and persistence markers already on the stored
    /// document are kept.
    async fn replace(&self, _key_path: &KeyPath, _doc: &Value) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("replace"))
    }

    /// Start grouping writes so that [`rollback`](Self::rollback) can undo
    /// them. Backends without transactions accept and ignore this.
    async fn begin(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Keep every write since [`begin`](Self::begin).
    async fn commit(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Undo every write since [`begin`](Self::begin).
    async fn rollback(&self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("rollback"))
    }

    /// Make `new_key_path` resolve to the record stored at `old_key_path`.
    /// Only meaningful for local backends.
    async fn link(&self, _new_key_path: &KeyPath, _old_key_path: &KeyPath) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("link"))
    }

    /// Insert into an ordered sequence. `None` appends. Returns the id of
    /// the inserted element.
    async fn insert(&self, key_path: &KeyPath, index: Option<usize>, doc: &Value) -> Result<String, StorageError>;

    /// Remove and return the element at `index`.
    async fn extract(&self, key_path: &KeyPath, index: usize) -> Result<Value, StorageError>;

    /// All elements of a sequence, in order. An absent sequence is empty.
    async fn all(&self, key_path: &KeyPath) -> Result<Vec<Value>, StorageError>;

    /// Replace the element at `index` in place.
    async fn update_at(&self, key_path: &KeyPath, index: usize, doc: &Value) -> Result<(), StorageError>;

    /// Head of a sequence without removing it.
    /// Default implementation falls back to `all`.
    async fn first(&self, key_path: &KeyPath) -> Result<Option<Value>, StorageError> {
        Ok(self.all(key_path).await?.into_iter().next())
    }
}
