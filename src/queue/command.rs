//! Durable queue commands.
//!
//! Commands are stored in the durable log as tagged JSON:
//!
//! ```text
//! {"cmd":"create","key_path":["todos"],"args":{"text":"a","_cid":"c1"}}
//! {"cmd":"update","key_path":["todos","c1"],"args":{"text":"b"}}
//! {"cmd":"delete","key_path":["todos","c1"]}
//! {"cmd":"add","key_path":["users","u1","todos"],"items_key_path":["todos"],"item_ids":["c1"]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key_path::KeyPath;
use crate::storage::CID_FIELD;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum QueueCommand {
    Create {
        key_path: KeyPath,
        args: Value,
    },
    Update {
        key_path: KeyPath,
        args: Value,
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

impl QueueCommand {
    /// Wire name, also used as a metrics label.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
        }
    }

    #[must_use]
    pub fn key_path(&self) -> &KeyPath {
        match self {
            Self::Create { key_path, .. }
            | Self::Update { key_path, .. }
            | Self::Delete { key_path }
            | Self::Add { key_path, .. }
            | Self::Remove { key_path, .. } => key_path,
        }
    }

    /// Client id recorded by a create.
    #[must_use]
    pub fn cid(&self) -> Option<&str> {
        match self {
            Self::Create { args, .. } => args.get(CID_FIELD).and_then(Value::as_str),
            _ => None,
        }
    }

    /// Rewrite every reference to `cid` (key path segments, item key path
    /// segments, item ids) to `id`. Returns whether anything changed.
    pub fn remap_id(&mut self, cid: &str, id: &str) -> bool {
        match self {
            Self::Create { key_path, .. } | Self::Update { key_path, .. } | Self::Delete { key_path } => {
                key_path.replace_segment(cid, id)
            }
            Self::Add { key_path, items_key_path, item_ids }
            | Self::Remove { key_path, items_key_path, item_ids } => {
                let mut changed = key_path.replace_segment(cid, id);
                changed |= items_key_path.replace_segment(cid, id);
                for item in item_ids.iter_mut().filter(|i| i.as_str() == cid) {
                    *item = id.to_string();
                    changed = true;
                }
                changed
            }
        }
    }
}
