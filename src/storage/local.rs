//! Local backend over the bounded persistent cache.
//!
//! Every record is a JSON value stored under the flattened key of its key
//! path:
//!
//! ```text
//! todos               {"kind":"members","data":[{"id":"c1","items":["todos"],"in_sync":false}]}
//! todos@c1            {"kind":"doc","data":{"text":"a","_id":"c1","_cid":"c1"}}
//! todos@s1            {"kind":"link","data":"todos@c1"}
//! meta@storageQueue   {"kind":"sequence","data":[...]}
//! ```
//!
//! Links let a record created under a client id also resolve under its
//! server id. A link chain that does not end in a document is an
//! [`StorageError::InvalidKey`].
//!
//! Every operation is all-or-nothing. Between [`Storage::begin`] and
//! [`Storage::commit`] the prior value of each written key is journaled and
//! the key is pinned against eviction, so a later write in the same
//! transaction (the queue's log append) cannot push out an earlier one, and
//! [`Storage::rollback`] restores everything.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{KvSubstrate, PersistentCache};
use crate::key_path::{KeyPath, KEY_SEPARATOR};
use super::query::{FindOptions, Query, SetOptions};
use super::traits::{Storage, StorageError};
use super::{doc_id, merge_fields, replace_keeping_markers, CID_FIELD, ID_FIELD, IN_SYNC_FIELD};

/// Longest link chain followed before giving up.
const MAX_LINK_DEPTH: usize = 16;

/// Bucket whose records are never evicted (durable queue log lives here).
pub const META_BUCKET: &str = "meta";

type Cache = PersistentCache<Box<dyn KvSubstrate>>;

/// The cache plus the undo journal of the open transaction, if any.
struct Records {
    cache: Cache,
    /// Value each written key had when the journal opened (`None`: absent)
    journal: Option<HashMap<String, Option<String>>>,
}

impl Records {
    fn get(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        self.cache.get_item(key)
    }

    fn set(&mut self, key: &str, raw: &str) -> Result<bool, StorageError> {
        self.save(key);
        self.cache.set_item(key, raw)
    }

    fn remove(&mut self, key: &str) -> Result<bool, StorageError> {
        self.save(key);
        self.cache.remove_item(key)
    }

    fn save(&mut self, key: &str) {
        if let Some(journal) = self.journal.as_mut() {
            if !journal.contains_key(key) {
                journal.insert(key.to_string(), self.cache.peek(key));
            }
            self.cache.pin(key);
        }
    }

    /// Open a journal unless one is already open. Returns whether it did.
    fn open_journal(&mut self) -> bool {
        if self.journal.is_some() {
            return false;
        }
        self.journal = Some(HashMap::new());
        true
    }

    fn close_journal(&mut self) {
        self.journal = None;
        self.cache.unpin_all();
    }

    /// Put every journaled key back the way it was and close the journal.
    fn undo(&mut self) -> Result<(), StorageError> {
        let Some(journal) = self.journal.take() else {
            return Ok(());
        };
        self.cache.unpin_all();

        // Deletions first so the restored values have room
        let mut entries: Vec<(String, Option<String>)> = journal.into_iter().collect();
        entries.sort_by_key(|(_, prior)| prior.is_some());
        for (key, _) in &entries {
            self.cache.pin(key);
        }

        let mut result = Ok(());
        for (key, prior) in entries {
            let restored = match prior {
                Some(raw) => match self.cache.set_item(&key, &raw) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(StorageError::CapacityExceeded {
                        key: key.clone(),
                        size: raw.len(),
                        max_size: self.cache.max_size(),
                    }),
                    Err(e) => Err(e),
                },
                None => self.cache.remove_item(&key).map(|_| ()),
            };
            if let Err(e) = restored {
                warn!(key = %key, error = %e, "Failed to restore record");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.cache.unpin_all();
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
enum Record {
    Doc(Value),
    Link(String),
    Members(Vec<Member>),
    Sequence(Vec<Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Member {
    id: String,
    items: KeyPath,
    #[serde(default)]
    in_sync: bool,
}

pub struct LocalStorage {
    records: Mutex<Records>,
}

impl LocalStorage {
    /// Open over `substrate` with a byte budget.
    pub fn open(substrate: Box<dyn KvSubstrate>, max_bytes: usize) -> Result<Self, StorageError> {
        let protected = vec![format!("{}{}", META_BUCKET, KEY_SEPARATOR)];
        let cache = PersistentCache::open_with_protected(substrate, max_bytes, protected)?;
        Ok(Self {
            records: Mutex::new(Records { cache, journal: None }),
        })
    }

    /// Bytes currently held by the underlying cache
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.records.lock().cache.size()
    }

    /// Number of records (documents, links, sets, sequences)
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().cache.is_empty()
    }

    /// Run `f` as one unit: on error its writes are undone, unless a
    /// transaction is open, which then owns the undo.
    fn with_cache<T>(&self, f: impl FnOnce(&mut Records) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let mut records = self.records.lock();
        let own = records.open_journal();
        let result = f(&mut records);
        if own {
            if result.is_ok() {
                records.close_journal();
            } else if let Err(e) = records.undo() {
                warn!(error = %e, "Failed to undo partial write");
            }
        }
        result
    }
}

fn read(cache: &mut Records, key: &str) -> Result<Option<Record>, StorageError> {
    match cache.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn write(cache: &mut Records, key: &str, record: &Record) -> Result<(), StorageError> {
    let raw = serde_json::to_string(record)?;
    if cache.set(key, &raw)? {
        Ok(())
    } else {
        Err(StorageError::CapacityExceeded {
            key: key.to_string(),
            size: raw.len(),
            max_size: cache.cache.max_size(),
        })
    }
}

/// Follow links from `key` to a document. Returns the key that actually
/// holds it and the document.
fn resolve(cache: &mut Records, key: &str) -> Result<(String, Value), StorageError> {
    let mut current = key.to_string();
    for depth in 0..MAX_LINK_DEPTH {
        match read(cache, &current)? {
            Some(Record::Doc(doc)) => return Ok((current, doc)),
            Some(Record::Link(target)) => current = target,
            Some(_) => return Err(StorageError::Backend(format!("'{}' is not a document", current))),
            None if depth == 0 => return Err(StorageError::NotFound(key.to_string())),
            None => return Err(StorageError::InvalidKey(key.to_string())),
        }
    }
    Err(StorageError::InvalidKey(key.to_string()))
}

fn read_members(cache: &mut Records, key: &str) -> Result<Option<Vec<Member>>, StorageError> {
    match read(cache, key)? {
        Some(Record::Members(members)) => Ok(Some(members)),
        Some(_) => Err(StorageError::Backend(format!("'{}' is not a collection", key))),
        None => Ok(None),
    }
}

/// Does `member` refer to the item known as `id` (directly, or through the
/// `_id` / `_cid` of the document it resolves to)?
fn member_matches(cache: &mut Records, member: &Member, id: &str) -> bool {
    if member.id == id {
        return true;
    }
    match resolve(cache, &member.items.child(&member.id).key()) {
        Ok((_, doc)) => {
            doc_id(&doc) == Some(id) || doc.get(CID_FIELD).and_then(Value::as_str) == Some(id)
        }
        Err(_) => false,
    }
}

fn add_members(
    cache: &mut Records,
    key_path: &KeyPath,
    items_key_path: &KeyPath,
    item_ids: &[String],
    opts: &SetOptions,
) -> Result<(), StorageError> {
    let key = key_path.key();
    let mut members = read_members(cache, &key)?.unwrap_or_default();
    for id in item_ids {
        let mut found = false;
        for member in members.iter_mut() {
            if member_matches(cache, member, id) {
                member.in_sync |= opts.in_sync;
                found = true;
            }
        }
        if !found {
            members.push(Member {
                id: id.clone(),
                items: items_key_path.clone(),
                in_sync: opts.in_sync,
            });
        }
    }
    let members = dedupe_members(cache, members);
    write(cache, &key, &Record::Members(members))
}

/// Collapse members that resolve to the same record (a client id and the
/// server id linked to it), keeping the first and the stronger sync flag.
fn dedupe_members(cache: &mut Records, members: Vec<Member>) -> Vec<Member> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Member> = Vec::with_capacity(members.len());
    for member in members {
        let Ok((key, _)) = resolve(cache, &member.items.child(&member.id).key()) else {
            kept.push(member);
            continue;
        };
        match seen.get(&key) {
            Some(&at) => kept[at].in_sync |= member.in_sync,
            None => {
                seen.insert(key, kept.len());
                kept.push(member);
            }
        }
    }
    kept
}

/// Write a document that does not exist yet and list it in its parent.
fn insert_doc(cache: &mut Records, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
    write(cache, &key_path.key(), &Record::Doc(doc.clone()))?;
    if let (Some(parent), Some(id)) = (key_path.parent(), key_path.id()) {
        add_members(cache, &parent, &parent, &[id.to_string()], &SetOptions::default())?;
    }
    Ok(())
}

/// Drop links under `bucket` that point at `target` through the `_id` or
/// `_cid` of the document stored there.
fn remove_aliases(cache: &mut Records, bucket: &KeyPath, target: &str, doc: &Value) -> Result<(), StorageError> {
    let aliases = [doc_id(doc), doc.get(CID_FIELD).and_then(Value::as_str)];
    for alias in aliases.into_iter().flatten() {
        let alias_key = bucket.child(alias).key();
        if alias_key == target {
            continue;
        }
        if let Some(Record::Link(to)) = read(cache, &alias_key)? {
            if to == target {
                cache.remove(&alias_key)?;
                debug!(alias = %alias_key, target, "Dropped link to deleted record");
            }
        }
    }
    Ok(())
}

fn remove_members(cache: &mut Records, key_path: &KeyPath, item_ids: &[String]) -> Result<(), StorageError> {
    let key = key_path.key();
    let Some(members) = read_members(cache, &key)? else {
        return Ok(());
    };
    let mut kept = Vec::with_capacity(members.len());
    for member in members {
        if !item_ids.iter().any(|id| member_matches(cache, &member, id)) {
            kept.push(member);
        }
    }
    write(cache, &key, &Record::Members(kept))
}

fn read_sequence(cache: &mut Records, key: &str) -> Result<Vec<Value>, StorageError> {
    match read(cache, key)? {
        Some(Record::Sequence(seq)) => Ok(seq),
        Some(_) => Err(StorageError::Backend(format!("'{}' is not a sequence", key))),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn create(&self, key_path: &KeyPath, doc: &Value) -> Result<String, StorageError> {
        self.with_cache(|cache| {
            let mut doc = doc.clone();
            let id = match doc_id(&doc) {
                Some(id) => id.to_string(),
                None => {
                    let cid = uuid::Uuid::new_v4().simple().to_string();
                    if let Some(obj) = doc.as_object_mut() {
                        obj.insert(ID_FIELD.to_string(), Value::String(cid.clone()));
                        obj.insert(CID_FIELD.to_string(), Value::String(cid.clone()));
                    }
                    cid
                }
            };
            write(cache, &key_path.child(&id).key(), &Record::Doc(doc))?;
            add_members(cache, key_path, key_path, &[id.clone()], &SetOptions::default())?;
            debug!(key_path = %key_path, id = %id, "Local create");
            Ok(id)
        })
    }

    async fn put(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        self.with_cache(|cache| match resolve(cache, &key_path.key()) {
            Ok((key, mut existing)) => {
                merge_fields(&mut existing, doc);
                write(cache, &key, &Record::Doc(existing))
            }
            Err(StorageError::NotFound(_)) => insert_doc(cache, key_path, doc),
            // A broken alias is overwritten by the document itself
            Err(StorageError::InvalidKey(_)) => write(cache, &key_path.key(), &Record::Doc(doc.clone())),
            Err(e) => Err(e),
        })
    }

    async fn replace(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        self.with_cache(|cache| match resolve(cache, &key_path.key()) {
            Ok((key, existing)) => write(cache, &key, &Record::Doc(replace_keeping_markers(&existing, doc))),
            Err(StorageError::NotFound(_)) => insert_doc(cache, key_path, doc),
            // A broken alias is overwritten by the document itself
            Err(StorageError::InvalidKey(_)) => write(cache, &key_path.key(), &Record::Doc(doc.clone())),
            Err(e) => Err(e),
        })
    }

    async fn fetch(&self, key_path: &KeyPath) -> Result<Value, StorageError> {
        self.with_cache(|cache| resolve(cache, &key_path.key()).map(|(_, doc)| doc))
    }

    async fn del(&self, key_path: &KeyPath) -> Result<(), StorageError> {
        self.with_cache(|cache| {
            let key = key_path.key();
            // Membership has to go first: matching resolves through the doc
            if let (Some(parent), Some(id)) = (key_path.parent(), key_path.id()) {
                remove_members(cache, &parent, &[id.to_string()])?;
            }
            match resolve(cache, &key) {
                Ok((resolved, doc)) => {
                    if let Some(parent) = key_path.parent() {
                        remove_aliases(cache, &parent, &resolved, &doc)?;
                    }
                    cache.remove(&resolved)?;
                }
                Err(StorageError::NotFound(_)) | Err(StorageError::InvalidKey(_)) => {}
                Err(e) => return Err(e),
            }
            cache.remove(&key)?;
            Ok(())
        })
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &SetOptions,
    ) -> Result<(), StorageError> {
        self.with_cache(|cache| add_members(cache, key_path, items_key_path, item_ids, opts))
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        _items_key_path: &KeyPath,
        item_ids: &[String],
        _opts: &SetOptions,
    ) -> Result<(), StorageError> {
        self.with_cache(|cache| remove_members(cache, key_path, item_ids))
    }

    /// Documents of a collection, each annotated with `_insync`.
    /// A collection that was never written is `NotFound`.
    async fn find(
        &self,
        key_path: &KeyPath,
        query: &Query,
        opts: &FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        self.with_cache(|cache| {
            let key = key_path.key();
            let members = read_members(cache, &key)?.ok_or(StorageError::NotFound(key))?;

            let mut docs = Vec::with_capacity(members.len());
            let mut listed = HashSet::new();
            for member in &members {
                match resolve(cache, &member.items.child(&member.id).key()) {
                    Ok((resolved, mut doc)) => {
                        if !listed.insert(resolved) || !query.matches(&doc) {
                            continue;
                        }
                        if let Some(obj) = doc.as_object_mut() {
                            obj.insert(IN_SYNC_FIELD.to_string(), Value::Bool(member.in_sync));
                        }
                        docs.push(doc);
                    }
                    Err(e) => debug!(member = %member.id, error = %e, "Skipping unresolvable member"),
                }
            }
            Ok(opts.paginate(docs))
        })
    }

    async fn begin(&self) -> Result<(), StorageError> {
        if self.records.lock().open_journal() {
            Ok(())
        } else {
            Err(StorageError::Backend("a transaction is already open".into()))
        }
    }

    async fn commit(&self) -> Result<(), StorageError> {
        self.records.lock().close_journal();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StorageError> {
        self.records.lock().undo()
    }

    async fn link(&self, new_key_path: &KeyPath, old_key_path: &KeyPath) -> Result<(), StorageError> {
        self.with_cache(|cache| {
            write(cache, &new_key_path.key(), &Record::Link(old_key_path.key()))?;
            debug!(from = %new_key_path, to = %old_key_path, "Linked key paths");
            Ok(())
        })
    }

    async fn insert(&self, key_path: &KeyPath, index: Option<usize>, doc: &Value) -> Result<String, StorageError> {
        self.with_cache(|cache| {
            let key = key_path.key();
            let mut seq = read_sequence(cache, &key)?;
            let at = index.unwrap_or(seq.len()).min(seq.len());
            seq.insert(at, doc.clone());
            write(cache, &key, &Record::Sequence(seq))?;
            Ok(at.to_string())
        })
    }

    async fn extract(&self, key_path: &KeyPath, index: usize) -> Result<Value, StorageError> {
        self.with_cache(|cache| {
            let key = key_path.key();
            let mut seq = read_sequence(cache, &key)?;
            if index >= seq.len() {
                return Err(StorageError::NotFound(format!("{}[{}]", key, index)));
            }
            let value = seq.remove(index);
            write(cache, &key, &Record::Sequence(seq))?;
            Ok(value)
        })
    }

    async fn all(&self, key_path: &KeyPath) -> Result<Vec<Value>, StorageError> {
        self.with_cache(|cache| read_sequence(cache, &key_path.key()))
    }

    async fn update_at(&self, key_path: &KeyPath, index: usize, doc: &Value) -> Result<(), StorageError> {
        self.with_cache(|cache| {
            let key = key_path.key();
            let mut seq = read_sequence(cache, &key)?;
            match seq.get_mut(index) {
                Some(slot) => *slot = doc.clone(),
                None => return Err(StorageError::NotFound(format!("{}[{}]", key, index))),
            }
            write(cache, &key, &Record::Sequence(seq))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySubstrate;
    use serde_json::json;

    fn local(max: usize) -> LocalStorage {
        LocalStorage::open(Box::new(MemorySubstrate::new()), max).unwrap()
    }

    fn todos() -> KeyPath {
        KeyPath::from(["todos"])
    }

    #[tokio::test]
    async fn test_create_assigns_cid() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        assert_eq!(cid.len(), 32);

        let doc = store.fetch(&todos().child(&cid)).await.unwrap();
        assert_eq!(doc["text"], "a");
        assert_eq!(doc["_id"], cid.as_str());
        assert_eq!(doc["_cid"], cid.as_str());
    }

    #[tokio::test]
    async fn test_create_echoes_explicit_id() {
        let store = local(1 << 20);
        let id = store.create(&todos(), &json!({"_id": "given"})).await.unwrap();
        assert_eq!(id, "given");
        let doc = store.fetch(&todos().child("given")).await.unwrap();
        assert!(doc.get("_cid").is_none());
    }

    #[tokio::test]
    async fn test_find_returns_members_with_sync_marker() {
        let store = local(1 << 20);
        store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.create(&todos(), &json!({"text": "b", "done": true})).await.unwrap();

        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["_insync"], false);

        let done = store
            .find(&todos(), &Query::all().eq("done", json!(true)), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["text"], "b");
    }

    #[tokio::test]
    async fn test_find_unknown_collection_is_not_found() {
        let store = local(1 << 20);
        let err = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_link_resolves_both_ids() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.link(&todos().child("s1"), &todos().child(&cid)).await.unwrap();

        let via_server = store.fetch(&todos().child("s1")).await.unwrap();
        let via_client = store.fetch(&todos().child(&cid)).await.unwrap();
        assert_eq!(via_server, via_client);

        // Writes through the link land on the original record
        store.put(&todos().child("s1"), &json!({"text": "b"})).await.unwrap();
        let doc = store.fetch(&todos().child(&cid)).await.unwrap();
        assert_eq!(doc["text"], "b");
    }

    #[tokio::test]
    async fn test_dangling_link_is_invalid_key() {
        let store = local(1 << 20);
        store.link(&todos().child("s1"), &todos().child("gone")).await.unwrap();

        let err = store.fetch(&todos().child("s1")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(ref k) if k == "todos@s1"));

        let err = store.fetch(&todos().child("never")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_replace_overwrites_dangling_link() {
        let store = local(1 << 20);
        store.link(&todos().child("s1"), &todos().child("gone")).await.unwrap();

        store.replace(&todos().child("s1"), &json!({"_id": "s1", "text": "a"})).await.unwrap();
        assert_eq!(store.fetch(&todos().child("s1")).await.unwrap()["text"], "a");
    }

    #[tokio::test]
    async fn test_add_dedupes_by_resolved_id() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.put(&todos().child(&cid), &json!({"_id": "s1"})).await.unwrap();

        store
            .add(&todos(), &todos(), &["s1".to_string()], &SetOptions::in_sync())
            .await
            .unwrap();
        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["_insync"], true);

        store
            .remove(&todos(), &todos(), &["s1".to_string()], &SetOptions::default())
            .await
            .unwrap();
        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_del_removes_record_and_membership() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.del(&todos().child(&cid)).await.unwrap();

        assert!(store.fetch(&todos().child(&cid)).await.unwrap_err().is_not_found());
        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert!(all.is_empty());

        // Deleting again is fine
        store.del(&todos().child(&cid)).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_an_error() {
        let store = local(64);
        let big = "x".repeat(100);
        let err = store
            .put(&todos().child("1"), &json!({"text": big}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { .. }));
        assert!(store.fetch(&todos().child("1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sequence_survives_eviction_pressure() {
        let store = local(400);
        let log = KeyPath::from(["meta", "storageQueue"]);
        store.insert(&log, None, &json!({"cmd": "create"})).await.unwrap();

        // Separate buckets keep each membership set small
        for i in 0..20 {
            let bucket = format!("bucket{}", i);
            store
                .put(&KeyPath::from([bucket.as_str(), "1"]), &json!({"n": i}))
                .await
                .unwrap();
        }

        assert_eq!(store.all(&log).await.unwrap().len(), 1);
        assert!(store.size_bytes() <= 400);
    }

    #[tokio::test]
    async fn test_sequence_operations() {
        let store = local(1 << 20);
        let log = KeyPath::from(["meta", "log"]);
        assert!(store.all(&log).await.unwrap().is_empty());
        assert_eq!(store.first(&log).await.unwrap(), None);

        store.insert(&log, None, &json!(1)).await.unwrap();
        store.insert(&log, None, &json!(2)).await.unwrap();
        store.update_at(&log, 1, &json!(20)).await.unwrap();
        assert_eq!(store.first(&log).await.unwrap(), Some(json!(1)));
        assert_eq!(store.extract(&log, 0).await.unwrap(), json!(1));
        assert_eq!(store.all(&log).await.unwrap(), vec![json!(20)]);
        assert!(store.update_at(&log, 3, &json!(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_del_by_client_id_drops_server_link() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.put(&todos().child(&cid), &json!({"_id": "s1"})).await.unwrap();
        store.link(&todos().child("s1"), &todos().child(&cid)).await.unwrap();

        store.del(&todos().child(&cid)).await.unwrap();

        let err = store.fetch(&todos().child("s1")).await.unwrap_err();
        assert!(err.is_not_found(), "expected NotFound, got {}", err);
        // Only the emptied membership list is left
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_del_by_server_id_drops_record() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();
        store.put(&todos().child(&cid), &json!({"_id": "s1"})).await.unwrap();
        store.link(&todos().child("s1"), &todos().child(&cid)).await.unwrap();

        store.del(&todos().child("s1")).await.unwrap();
        assert!(store.fetch(&todos().child("s1")).await.unwrap_err().is_not_found());
        assert!(store.fetch(&todos().child(&cid)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_replace_drops_stale_fields() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a", "tag": "old"})).await.unwrap();

        store.replace(&todos().child(&cid), &json!({"_id": "s1", "text": "a2"})).await.unwrap();
        let doc = store.fetch(&todos().child(&cid)).await.unwrap();
        assert_eq!(doc, json!({"_id": "s1", "_cid": cid, "text": "a2"}));

        // Absent documents are created and listed
        store.replace(&todos().child("s9"), &json!({"_id": "s9"})).await.unwrap();
        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_add_collapses_aliases_of_one_record() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();

        // A server copy listed under its own id before the link exists
        store.put(&todos().child("s1"), &json!({"_id": "s1", "text": "a"})).await.unwrap();
        store.put(&todos().child(&cid), &json!({"_id": "s1"})).await.unwrap();
        store.link(&todos().child("s1"), &todos().child(&cid)).await.unwrap();
        store
            .add(&todos(), &todos(), &["s1".to_string()], &SetOptions::in_sync())
            .await
            .unwrap();

        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["_insync"], true);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let store = local(1 << 20);
        // The collection key holds a sequence, so listing the new doc fails
        store.insert(&todos(), None, &json!(1)).await.unwrap();
        let before = store.len();

        assert!(store.create(&todos(), &json!({"text": "a"})).await.is_err());
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_state() {
        let store = local(1 << 20);
        let cid = store.create(&todos(), &json!({"text": "a"})).await.unwrap();

        store.begin().await.unwrap();
        assert!(store.begin().await.is_err());
        store.put(&todos().child(&cid), &json!({"text": "b"})).await.unwrap();
        store.create(&todos(), &json!({"text": "c"})).await.unwrap();
        store.rollback().await.unwrap();

        let all = store.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["text"], "a");

        // A fresh transaction can start and its writes stick
        store.begin().await.unwrap();
        store.put(&todos().child(&cid), &json!({"text": "d"})).await.unwrap();
        store.commit().await.unwrap();
        assert_eq!(store.fetch(&todos().child(&cid)).await.unwrap()["text"], "d");
    }

    #[tokio::test]
    async fn test_transaction_keeps_its_writes_from_eviction() {
        let store = local(200);
        let log = KeyPath::from(["meta", "storageQueue"]);

        store.begin().await.unwrap();
        store.put(&todos().child("1"), &json!({"text": "x".repeat(60)})).await.unwrap();
        let err = store.insert(&log, None, &json!("y".repeat(80))).await.unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { .. }));
        // The document is still there for the rollback to remove
        assert!(store.fetch(&todos().child("1")).await.is_ok());
        store.rollback().await.unwrap();

        assert!(store.fetch(&todos().child("1")).await.unwrap_err().is_not_found());
        assert!(store.is_empty());
    }
}
