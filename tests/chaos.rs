//! Chaos Testing for the Offline Sync Engine
//!
//! Failure scenarios driven by:
//! 1. **FailingStorage wrapper** - precise error injection at specific call counts
//! 2. **Capacity pressure** - local writes that cannot fit
//! 3. **Data corruption** - garbage in the durable log and the cache substrate
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use offline_sync::cache::{KvSubstrate, MemorySubstrate, PersistentCache};
use offline_sync::storage::local::LocalStorage;
use offline_sync::storage::memory::InMemoryStorage;
use offline_sync::{
    FindOptions, KeyPath, OfflineSyncConfig, Query, QueueError, SetOptions, Storage, StorageError,
    StorageQueue,
};

// =============================================================================
// Failing Storage Wrapper - Precise Error Injection
// =============================================================================

/// A wrapper that injects failures at specific call counts.
pub struct FailingStorage<S: Storage> {
    inner: S,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call while set
    fail_all: AtomicBool,
    /// Fail only log appends while set
    fail_inserts: AtomicBool,
    error_msg: String,
}

impl<S: Storage> FailingStorage<S> {
    pub fn new(inner: S, fail_on_calls: Vec<u64>, error_msg: &str) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            fail_all: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            error_msg: error_msg.to_string(),
        }
    }

    /// A store that fails everything until [`heal`](Self::heal) is called.
    pub fn down(inner: S, error_msg: &str) -> Self {
        let store = Self::new(inner, vec![], error_msg);
        store.fail_all.store(true, Ordering::SeqCst);
        store
    }

    pub fn heal(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_all.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count) {
            Err(StorageError::Backend(self.error_msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for FailingStorage<S> {
    async fn create(&self, key_path: &KeyPath, doc: &Value) -> Result<String, StorageError> {
        self.maybe_fail()?;
        self.inner.create(key_path, doc).await
    }

    async fn put(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.put(key_path, doc).await
    }

    async fn fetch(&self, key_path: &KeyPath) -> Result<Value, StorageError> {
        self.maybe_fail()?;
        self.inner.fetch(key_path).await
    }

    async fn del(&self, key_path: &KeyPath) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.del(key_path).await
    }

    async fn add(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &SetOptions,
    ) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.add(key_path, items_key_path, item_ids, opts).await
    }

    async fn remove(
        &self,
        key_path: &KeyPath,
        items_key_path: &KeyPath,
        item_ids: &[String],
        opts: &SetOptions,
    ) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.remove(key_path, items_key_path, item_ids, opts).await
    }

    async fn find(&self, key_path: &KeyPath, query: &Query, opts: &FindOptions) -> Result<Vec<Value>, StorageError> {
        self.maybe_fail()?;
        self.inner.find(key_path, query, opts).await
    }

    async fn insert(&self, key_path: &KeyPath, index: Option<usize>, doc: &Value) -> Result<String, StorageError> {
        self.maybe_fail()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(self.error_msg.clone()));
        }
        self.inner.insert(key_path, index, doc).await
    }

    async fn extract(&self, key_path: &KeyPath, index: usize) -> Result<Value, StorageError> {
        self.maybe_fail()?;
        self.inner.extract(key_path, index).await
    }

    async fn all(&self, key_path: &KeyPath) -> Result<Vec<Value>, StorageError> {
        self.maybe_fail()?;
        self.inner.all(key_path).await
    }

    async fn update_at(&self, key_path: &KeyPath, index: usize, doc: &Value) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.update_at(key_path, index, doc).await
    }

    async fn replace(&self, key_path: &KeyPath, doc: &Value) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.replace(key_path, doc).await
    }

    async fn link(&self, new_key_path: &KeyPath, old_key_path: &KeyPath) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.link(new_key_path, old_key_path).await
    }

    // Transaction control is never failed on purpose

    async fn begin(&self) -> Result<(), StorageError> {
        self.inner.begin().await
    }

    async fn commit(&self) -> Result<(), StorageError> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<(), StorageError> {
        self.inner.rollback().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> OfflineSyncConfig {
    OfflineSyncConfig {
        replay_initial_delay_ms: 1,
        replay_max_delay_ms: 5,
        ..Default::default()
    }
}

fn memory_local(max_bytes: usize) -> Arc<LocalStorage> {
    Arc::new(open_local(max_bytes))
}

fn open_local(max_bytes: usize) -> LocalStorage {
    LocalStorage::open(Box::new(MemorySubstrate::new()), max_bytes).unwrap()
}

fn server() -> InMemoryStorage {
    InMemoryStorage::with_id_prefix("s")
}

async fn settle(queue: &StorageQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !queue.is_draining() && queue.pending().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("queue did not drain in time");
}

fn todos() -> KeyPath {
    KeyPath::from(["todos"])
}

// =============================================================================
// Remote Failures
// =============================================================================

#[tokio::test]
async fn chaos_transient_remote_failures_are_retried() {
    // First two remote calls fail, then the server recovers
    let remote = Arc::new(FailingStorage::new(server(), vec![1, 2], "connection reset"));
    let queue = StorageQueue::open(memory_local(1 << 20), Some(remote.clone()), &fast_config())
        .await
        .unwrap();

    let cid = queue.create(&todos(), &json!({"text": "a"})).await.unwrap();
    queue.put(&todos().child(&cid), &json!({"text": "b"})).await.unwrap();
    settle(&queue).await;

    assert_eq!(remote.calls(), 4);
    assert_eq!(remote.inner.get(&todos().child("s1")).unwrap()["text"], "b");
}

#[tokio::test]
async fn chaos_failing_head_blocks_later_commands() {
    let remote = Arc::new(FailingStorage::down(server(), "503"));
    let queue = StorageQueue::open(memory_local(1 << 20), Some(remote.clone()), &fast_config())
        .await
        .unwrap();

    queue.create(&todos(), &json!({"text": "first"})).await.unwrap();
    queue.create(&todos(), &json!({"text": "second"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Nothing got through and nothing was skipped
    assert!(remote.inner.is_empty());
    assert_eq!(queue.pending().await.unwrap().len(), 2);
    assert!(queue.is_draining());

    remote.heal();
    settle(&queue).await;
    assert_eq!(remote.inner.get(&todos().child("s1")).unwrap()["text"], "first");
    assert_eq!(remote.inner.get(&todos().child("s2")).unwrap()["text"], "second");
}

#[tokio::test]
async fn chaos_bounded_retry_reports_stall() {
    let remote = Arc::new(FailingStorage::down(server(), "permission denied"));
    let config = OfflineSyncConfig { replay_max_retries: Some(3), ..fast_config() };
    let queue = StorageQueue::open(memory_local(1 << 20), Some(remote.clone()), &config).await.unwrap();
    let mut stalled = queue.events().subscribe_stalled();

    queue.create(&todos(), &json!({"text": "a"})).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), stalled.recv()).await.unwrap().unwrap();
    assert_eq!(event.attempts, 3);
    assert_eq!(event.command.name(), "create");
    assert!(event.error.contains("permission denied"));

    // The command stays at the head until the next synchronize
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!queue.is_draining());
    assert_eq!(queue.pending().await.unwrap().len(), 1);

    remote.heal();
    queue.synchronize();
    settle(&queue).await;
    assert!(remote.inner.get(&todos().child("s1")).is_some());
}

#[tokio::test]
async fn chaos_close_stops_replay() {
    let remote = Arc::new(FailingStorage::down(server(), "timeout"));
    let queue = StorageQueue::open(memory_local(1 << 20), Some(remote.clone()), &fast_config())
        .await
        .unwrap();

    queue.create(&todos(), &json!({"text": "a"})).await.unwrap();
    queue.close();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!queue.is_draining());
    let calls = remote.calls();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(remote.calls(), calls);

    // The log is untouched for the next run
    assert_eq!(queue.pending().await.unwrap().len(), 1);
    assert!(matches!(queue.put(&todos().child("x"), &json!({})).await, Err(QueueError::Closed)));
}

#[tokio::test]
async fn chaos_close_cuts_backoff_short() {
    let remote = Arc::new(FailingStorage::down(server(), "timeout"));
    let config = OfflineSyncConfig {
        replay_initial_delay_ms: 60_000,
        replay_max_delay_ms: 60_000,
        ..fast_config()
    };
    let queue = StorageQueue::open(memory_local(1 << 20), Some(remote.clone()), &config).await.unwrap();

    queue.create(&todos(), &json!({"text": "a"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.is_draining());
    assert_eq!(remote.calls(), 1);

    queue.close();
    tokio::time::timeout(Duration::from_secs(1), async {
        while queue.is_draining() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("drain kept sleeping after close");
    assert_eq!(remote.calls(), 1);
    assert_eq!(queue.pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn chaos_cold_read_with_remote_down_is_an_error() {
    let remote = Arc::new(FailingStorage::down(server(), "unreachable"));
    let queue = StorageQueue::new(memory_local(1 << 20), Some(remote), &fast_config());

    let result = queue.find(&todos(), &Query::all(), &FindOptions::default()).await;
    assert!(matches!(result, Err(QueueError::Remote(StorageError::Backend(_)))));

    let result = queue.fetch(&todos().child("s1")).await;
    assert!(matches!(result, Err(QueueError::Remote(_))));
}

#[tokio::test]
async fn chaos_background_revalidation_failure_keeps_local_answer() {
    let remote = Arc::new(FailingStorage::new(server(), vec![], "flaky"));
    remote.inner.create(&todos(), &json!({"text": "a"})).await.unwrap();
    let queue = StorageQueue::new(memory_local(1 << 20), Some(remote.clone()), &fast_config());

    let warm = queue.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
    assert_eq!(warm.len(), 1);

    remote.fail_all.store(true, Ordering::SeqCst);
    let stale = queue.find(&todos(), &Query::all(), &FindOptions::default()).await.unwrap();
    assert_eq!(stale, warm);
}

// =============================================================================
// Local Failures
// =============================================================================

#[tokio::test]
async fn chaos_local_capacity_failure_queues_nothing() {
    let remote = Arc::new(server());
    let queue = StorageQueue::open(memory_local(256), Some(remote.clone()), &fast_config())
        .await
        .unwrap();

    let big = "x".repeat(1024);
    let result = queue.create(&todos(), &json!({"text": big})).await;
    assert!(matches!(result, Err(QueueError::Local(StorageError::CapacityExceeded { .. }))));

    assert!(queue.pending().await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(remote.is_empty());
}

#[tokio::test]
async fn chaos_local_backend_failure_surfaces_immediately() {
    // Local create fails on its first call
    let local = Arc::new(FailingStorage::new(server(), vec![1], "disk full"));
    let remote = Arc::new(server());
    let queue = StorageQueue::new(local.clone(), Some(remote.clone()), &fast_config());

    let result = queue.create(&todos(), &json!({"text": "a"})).await;
    assert!(matches!(result, Err(QueueError::Local(StorageError::Backend(_)))));
    assert!(queue.pending().await.unwrap().is_empty());
    assert!(remote.is_empty());
}

#[tokio::test]
async fn chaos_log_append_failure_undoes_local_write() {
    let local = Arc::new(FailingStorage::new(open_local(1 << 20), vec![], "log full"));
    let remote = Arc::new(server());
    let queue = StorageQueue::new(local.clone(), Some(remote.clone()), &fast_config());
    let x1 = todos().child("x1");

    local.fail_inserts.store(true, Ordering::SeqCst);
    let result = queue.put(&x1, &json!({"text": "b"})).await;
    assert!(matches!(result, Err(QueueError::Local(StorageError::Backend(_)))));
    assert!(local.inner.fetch(&x1).await.unwrap_err().is_not_found());

    let result = queue.create(&todos(), &json!({"text": "c"})).await;
    assert!(result.is_err());
    assert!(local.inner.is_empty());
    assert!(queue.pending().await.unwrap().is_empty());

    // An update to an existing document is rolled back to the old content
    local.fail_inserts.store(false, Ordering::SeqCst);
    queue.put(&x1, &json!({"text": "a"})).await.unwrap();
    settle(&queue).await;

    local.fail_inserts.store(true, Ordering::SeqCst);
    assert!(queue.put(&x1, &json!({"text": "b", "done": true})).await.is_err());
    let doc = local.inner.fetch(&x1).await.unwrap();
    assert_eq!(doc["text"], "a");
    assert!(doc.get("done").is_none());
    assert!(queue.pending().await.unwrap().is_empty());
    assert_eq!(remote.get(&x1).unwrap()["text"], "a");
}

#[tokio::test]
async fn chaos_log_append_never_evicts_its_own_write() {
    let local = memory_local(400);
    let remote = Arc::new(server());
    let queue = StorageQueue::new(local.clone(), Some(remote.clone()), &fast_config());
    let x1 = todos().child("x1");

    // The document fits on its own but not alongside its log entry
    let result = queue.put(&x1, &json!({"text": "y".repeat(150)})).await;
    assert!(matches!(result, Err(QueueError::Local(StorageError::CapacityExceeded { .. }))));
    assert!(local.fetch(&x1).await.unwrap_err().is_not_found());
    assert!(queue.pending().await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(remote.is_empty());
}

#[tokio::test]
async fn chaos_log_append_evicts_unrelated_records() {
    let local = memory_local(400);
    let notes = KeyPath::from(["notes", "n1"]);
    local.put(&notes, &json!({"text": "z".repeat(150)})).await.unwrap();

    let remote = Arc::new(server());
    let queue = StorageQueue::new(local.clone(), Some(remote.clone()), &fast_config());
    let x1 = todos().child("x1");

    queue.put(&x1, &json!({"text": "short"})).await.unwrap();
    assert_eq!(local.fetch(&x1).await.unwrap()["text"], "short");
    assert!(local.fetch(&notes).await.is_err());

    settle(&queue).await;
    assert_eq!(remote.get(&x1).unwrap()["text"], "short");
}

// =============================================================================
// Client Ids
// =============================================================================

#[tokio::test]
async fn chaos_delete_by_client_id_after_remap() {
    let local = memory_local(1 << 20);
    let remote = Arc::new(server());
    let queue = StorageQueue::new(local.clone(), Some(remote.clone()), &fast_config());
    let mut created = queue.events().subscribe_created();

    let cid = queue.create(&todos(), &json!({"text": "a"})).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), created.recv()).await.unwrap().unwrap();
    assert_eq!(event.id, "s1");
    settle(&queue).await;

    queue.del(&todos().child(&cid)).await.unwrap();
    settle(&queue).await;
    assert!(remote.is_empty());

    // Neither id leaves anything behind locally
    assert!(local.fetch(&todos().child(&cid)).await.unwrap_err().is_not_found());
    assert!(local.fetch(&todos().child("s1")).await.unwrap_err().is_not_found());
    match queue.fetch(&todos().child("s1")).await {
        Err(QueueError::Remote(e)) => assert!(e.is_not_found()),
        other => panic!("unexpected {:?}", other),
    }
    let opts = FindOptions { local_only: true, ..Default::default() };
    assert!(queue.find(&todos(), &Query::all(), &opts).await.unwrap().is_empty());
}

// =============================================================================
// Corruption
// =============================================================================

#[tokio::test]
async fn chaos_undecodable_log_head_is_dropped() {
    let local = memory_local(1 << 20);
    let config = fast_config();
    let log = config.queue_key_path();
    local.insert(&log, None, &json!({"cmd": "teleport"})).await.unwrap();
    local
        .insert(&log, None, &json!({"cmd": "create", "key_path": ["todos"], "args": {"text": "ok", "_cid": "c1"}}))
        .await
        .unwrap();

    let remote = Arc::new(server());
    let queue = StorageQueue::open(local, Some(remote.clone()), &config).await.unwrap();
    settle(&queue).await;

    assert_eq!(remote.get(&todos().child("s1")).unwrap()["text"], "ok");
}

#[test]
fn chaos_malformed_cache_entries_are_skipped() {
    let mut substrate = MemorySubstrate::new();
    substrate.set("good", "1700000000000|value").unwrap();
    substrate.set("no_timestamp", "value").unwrap();
    substrate.set("bad_timestamp", "abc|value").unwrap();

    let mut cache = PersistentCache::open(substrate, 1024).unwrap();
    assert_eq!(cache.keys(), vec!["good"]);
    assert_eq!(cache.get_item("good").unwrap().as_deref(), Some("value"));
    assert_eq!(cache.get_item("no_timestamp").unwrap(), None);
}
