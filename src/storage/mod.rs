//! Storage backends.
//!
//! - [`traits`]: the [`Storage`](traits::Storage) contract and [`StorageError`](traits::StorageError)
//! - [`memory`]: DashMap-backed backend (remote stand-in, tests)
//! - [`local`]: adapter over the bounded [`PersistentCache`](crate::cache::PersistentCache)
//! - [`query`]: find filters and options

pub mod traits;
pub mod query;
pub mod memory;
pub mod local;

use serde_json::Value;

/// Document marker fields.
pub const ID_FIELD: &str = "_id";
pub const CID_FIELD: &str = "_cid";
pub const PERSISTED_FIELD: &str = "_persisted";
pub const IN_SYNC_FIELD: &str = "_insync";

/// The `_id` of a document, if it has a string one.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Shallow merge: object fields from `patch` overwrite `target`.
/// Anything that is not an object pair is replaced wholesale.
pub(crate) fn merge_fields(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// `doc` carrying over the `_id`, `_cid` and `_persisted` markers of
/// `existing` that `doc` does not set itself. Every other field comes from
/// `doc` alone.
pub(crate) fn replace_keeping_markers(existing: &Value, doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let (Some(obj), Some(existing)) = (doc.as_object_mut(), existing.as_object()) {
        for marker in [ID_FIELD, CID_FIELD, PERSISTED_FIELD] {
            if let Some(value) = existing.get(marker) {
                obj.entry(marker.to_string()).or_insert_with(|| value.clone());
            }
        }
    }
    doc
}

/// Copy of `doc` with `_id` set.
pub(crate) fn with_id(doc: &Value, id: &str) -> Value {
    let mut doc = doc.clone();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    doc
}
