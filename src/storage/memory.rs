use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::key_path::KeyPath;
use super::query::{FindOptions, Query, SetOptions};
use super::traits::{Storage, StorageError};
use super::{doc_id, merge_fields, replace_keeping_markers, with_id};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberRef {
    items: KeyPath,
    id: String,
}

/// In-memory backend.
///
/// Plays the server side in tests and embedded setups: it assigns its own
/// ids on `create`, keeps collection membership and ordered sequences.
pub struct InMemoryStorage {
    docs: DashMap<String, Value>,
    members: DashMap<String, Vec<MemberRef>>,
    sequences: DashMap<String, Vec<Value>>,
    id_prefix: Option<String>,
    next_id: AtomicU64,
}

impl InMemoryStorage {
    /// Ids are random UUIDs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            members: DashMap::new(),
            sequences: DashMap::new(),
            id_prefix: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Ids are `<prefix>1`, `<prefix>2`, ...
    #[must_use]
    pub fn with_id_prefix(prefix: &str) -> Self {
        Self {
            id_prefix: Some(prefix.to_string()),
            ..Self::new()
        }
    }

    /// Number of stored documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Direct document read, bypassing the async contract.
    #[must_use]
    pub fn get(&self, key_path: &KeyPath) -> Option<Value> {
        self.docs.get(&key_path.key()).map(|r| r.value().clone())
    }

    /// Remove every document, membership set and sequence.
    pub fn clear(&self) {
        self.docs.clear();
        self.members.clear();
        self.sequences.clear();
    }

    fn generate_id(&self) -> String {
        match &self.id_prefix {
            Some(prefix) => {
                let n = self.next_id.fetch_add(1, Ordering::Relaxed);
                format!("{}{}", prefix, n)
            }
            None => uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    fn add_member(&self, collection: &KeyPath, items: &KeyPath, id: &str) {
        let mut set = self.members.entry(collection.key()).or_default();
        if !set.iter().any(|m| m.id == id) {
            set.push(MemberRef {
                items: items.clone(),
                id: id.to_string(),
            });
        }
    }

    fn remove_member(&self, collection: &KeyPath, id: &str) {
        if let Some(mut set) = self.members.get_mut(&collection.key()) {
            set.retain(|m| m.id != id);
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create(&self, key_path: &KeyPath, doc: &Value) -> Result<String, StorageError> {
        let id = doc_id(doc)
            .map(str::to_string)
            .unwrap_or_else(|| self.generate_id());
        self.docs.insert(key_path.child(&id).key(), with_id(doc, &id));
        self.add_member(key_path, key_path, &id);
        Ok(id)
    }

    async fn put(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        let key = key_path.key();
        let created = {
            let mut entry = self.docs.entry(key).or_insert(Value::Null);
            let created = entry.is_null();
            merge_fields(entry.value_mut(), doc);
            created
        };
        if created {
            if let (Some(parent), Some(id)) = (key_path.parent(), key_path.id()) {
                self.add_member(&parent, &parent, id);
            }
        }
        Ok(())
    }

    async fn replace(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        let key = key_path.key();
        let created = {
            let mut entry = self.docs.entry(key).or_insert(Value::Null);
            let created = entry.is_null();
            let replaced = replace_keeping_markers(entry.value(), doc);
            *entry.value_mut() = replaced;
            created
        };
        if created {
            if let (Some(parent), Some(id)) = (key_path.parent(), key_path.id()) {
                self.add_member(&parent, &parent, id);
            }
        }
        Ok(())
    }

    async fn fetch(&self, key_path: &KeyPath) -> Result<Value, StorageError> {
        self.get(key_path)
            .ok_or_else(|| StorageError::NotFound(key_path.key()))
    }

    async fn del(&self, key_path: &KeyPath) -> Result<(), StorageError> {
        self.docs.remove(&key_path.key());
        if let (Some(parent), Some(id)) = (key_path.parent(), key_path.id()) {
            self.remove_member(&parent, id);
        }
        Ok(())
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        _opts: &SetOptions,
    ) -> Result<(), StorageError> {
        for id in item_ids {
            self.add_member(key_path, items_key_path, id);
        }
        Ok(())
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        _items_key_path: &KeyPath,
        item_ids: &[String],
        _opts: &SetOptions,
    ) -> Result<(), StorageError> {
        for id in item_ids {
            self.remove_member(key_path, id);
        }
        Ok(())
    }

    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: &FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        let members = self
            .members
            .get(&key_path.key())
            .map(|r| r.value().clone())
            .unwrap_or_default();

        let docs = members
            .iter()
            .filter_map(|m| self.get(&m.items.child(&m.id)))
            .filter(|doc| query.matches(doc))
            .collect();
        Ok(opts.paginate(docs))
    }

    async fn insert(&self, key_path: &KeyPath, index: Option<usize>, doc: &Value) -> Result<String, StorageError> {
        let mut seq = self.sequences.entry(key_path.key()).or_default();
        let at = index.unwrap_or(seq.len()).min(seq.len());
        seq.insert(at, doc.clone());
        Ok(at.to_string())
    }

    async fn extract(&self, key_path: &KeyPath, index: usize) -> Result<Value, StorageError> {
        let mut seq = self
            .sequences
            .get_mut(&key_path.key())
            .ok_or_else(|| StorageError::NotFound(key_path.key()))?;
        if index >= seq.len() {
            return Err(StorageError::NotFound(format!("{}[{}]", key_path.key(), index)));
        }
        Ok(seq.remove(index))
    }

    async fn all(&self, key_path: &KeyPath) -> Result<Vec<Value>, StorageError> {
        Ok(self
            .sequences
            .get(&key_path.key())
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn update_at(&self, key_path: &KeyPath, index: usize, doc: &Value) -> Result<(), StorageError> {
        let mut seq = self
            .sequences
            .get_mut(&key_path.key())
            .ok_or_else(|| StorageError::NotFound(key_path.key()))?;
        match seq.get_mut(index) {
            Some(slot) => {
                *slot = doc.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("{}[{}]", key_path.key(), index))),
        }
    }
}
