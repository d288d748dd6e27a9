//! Collection diff between the local view and a fresh remote result.
//!
//! Identity is the document `_id` (the server id once a create is
//! confirmed). A local document counts as known to the server when its
//! membership is in sync (`_insync: true`). Marker fields (leading `_`)
//! never count as content.

use serde_json::Value;

use crate::storage::{doc_id, CID_FIELD, IN_SYNC_FIELD};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectionDiff {
    /// Remote documents the local side does not yet hold as in sync
    pub added: Vec<Value>,
    /// Local in-sync documents the remote no longer has
    pub removed: Vec<Value>,
    /// Remote documents whose content differs from the local copy
    pub updated: Vec<Value>,
    /// Remote documents in remote order, then local documents still pending
    pub items: Vec<Value>,
}

impl CollectionDiff {
    pub fn ids(docs: &[Value]) -> Vec<String> {
        docs.iter().filter_map(doc_id).map(str::to_string).collect()
    }
}

/// Diff `local` (as returned by a local find, with `_insync` markers)
/// against `remote`. When `removals` is false the remote result is treated
/// as partial and nothing is reported removed.
pub fn diff(local: &[Value], remote: &[Value], removals: bool) -> CollectionDiff {
    let mut out = CollectionDiff::default();

    for doc in remote {
        let Some(id) = doc_id(doc) else { continue };
        match local.iter().find(|l| same_item(l, id)) {
            Some(l) if in_sync(l) => {
                if !same_content(l, doc) {
                    out.updated.push(doc.clone());
                }
            }
            _ => out.added.push(doc.clone()),
        }
        out.items.push(doc.clone());
    }

    for doc in local {
        let known_remotely = doc_id(doc).is_some_and(|id| remote.iter().any(|r| doc_id(r) == Some(id)));
        if known_remotely {
            continue;
        }
        if removals && in_sync(doc) {
            out.removed.push(strip_sync_marker(doc.clone()));
        } else {
            out.items.push(strip_sync_marker(doc.clone()));
        }
    }

    out
}

/// Drop the `_insync` annotation added by local finds.
pub fn strip_sync_marker(mut doc: Value) -> Value {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove(IN_SYNC_FIELD);
    }
    doc
}

/// Do the non-marker fields of `a` and `b` agree?
pub fn same_content(a: &Value, b: &Value) -> bool {
    match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => {
            let fields = |m: &serde_json::Map<String, Value>| {
                m.iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<std::collections::BTreeMap<_, _>>()
            };
            fields(a) == fields(b)
        }
        _ => a == b,
    }
}

fn same_item(local: &Value, id: &str) -> bool {
    doc_id(local) == Some(id) || local.get(CID_FIELD).and_then(Value::as_str) == Some(id)
}

fn in_sync(doc: &Value) -> bool {
    doc.get(IN_SYNC_FIELD).and_then(Value::as_bool).unwrap_or(false)
}
