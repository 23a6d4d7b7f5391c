//! Durable, reorderable upload queues
//!
//! Each queue is user-scoped and named, holds positioned file items, and is
//! persisted through the queue store on every mutation. An auto-save task
//! additionally re-persists queues mutated within its interval, and all
//! persisted queues are reloaded at startup before new work is accepted.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::storage::QueueStore;

/// Queue item lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One file waiting in (or processed from) a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    /// Position within the queue; contiguous from zero
    pub position: usize,
    pub filename: String,
    pub size_bytes: u64,
    /// sha256 of the file bytes, used for duplicate detection
    pub content_hash: String,
    pub status: ItemStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// File bytes, held in memory until the item completes; not persisted
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// A user-scoped named queue; also the persisted record shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub paused: bool,
    pub items: Vec<QueueItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File handed to `add_items`
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Aggregate queue view without file bytes
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub paused: bool,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub items: Vec<QueueItem>,
}

type QueueKey = (String, String);

/// Manages durable upload queues for all users
pub struct UploadQueueManager {
    config: UploadConfig,
    store: Arc<dyn QueueStore>,
    queues: Arc<RwLock<HashMap<QueueKey, QueueRecord>>>,
    dirty: Arc<Mutex<HashSet<QueueKey>>>,
    shutdown: watch::Sender<bool>,
    autosave_task: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueueManager {
    pub fn new(config: UploadConfig, store: Arc<dyn QueueStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            queues: Arc::new(RwLock::new(HashMap::new())),
            dirty: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            autosave_task: Mutex::new(None),
        }
    }

    /// Reload all persisted queues; call before accepting new work.
    ///
    /// Items that were mid-flight when the process stopped return to pending
    /// so a consumer can pick them up again.
    pub fn load_persisted(&self) -> Result<usize> {
        let records = self.store.read_all()?;
        let count = records.len();
        let mut queues = self.queues.write();
        for mut record in records {
            for item in record.items.iter_mut() {
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                }
            }
            tracing::info!(
                "Restored queue '{}' for user {} ({} items)",
                record.name,
                record.user_id,
                record.items.len()
            );
            queues.insert((record.user_id.clone(), record.name.clone()), record);
        }
        Ok(count)
    }

    /// Create a queue, or return the existing one with the same name
    pub fn create_queue(&self, user_id: &str, name: &str) -> Result<QueueStatus> {
        if user_id.trim().is_empty() || name.trim().is_empty() {
            return Err(Error::Validation(
                "queue user and name must not be empty".into(),
            ));
        }

        let key = (user_id.to_string(), name.to_string());
        {
            let queues = self.queues.read();
            if let Some(existing) = queues.get(&key) {
                return Ok(Self::status_of(existing));
            }
        }

        let now = Utc::now();
        let record = QueueRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            paused: false,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let status = Self::status_of(&record);
        self.queues.write().insert(key.clone(), record.clone());
        self.persist(&key, &record);
        tracing::info!("Created upload queue '{}' for user {}", name, user_id);
        Ok(status)
    }

    /// Append files to a queue.
    ///
    /// Validates per-item and aggregate size limits; files whose content hash
    /// matches an item already waiting in the queue are skipped.
    pub fn add_items(
        &self,
        user_id: &str,
        name: &str,
        files: Vec<UploadFile>,
    ) -> Result<Vec<QueueItem>> {
        for file in &files {
            if file.data.len() as u64 > self.config.max_file_bytes {
                return Err(Error::Validation(format!(
                    "file '{}' exceeds the {} byte limit",
                    file.filename, self.config.max_file_bytes
                )));
            }
        }

        let key = (user_id.to_string(), name.to_string());
        let (added, record) = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;

            let pending_bytes: u64 = record
                .items
                .iter()
                .filter(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Processing))
                .map(|i| i.size_bytes)
                .sum();
            let incoming: u64 = files.iter().map(|f| f.data.len() as u64).sum();
            if pending_bytes + incoming > self.config.max_total_bytes {
                return Err(Error::ResourceExhausted(format!(
                    "queue '{}' would exceed its {} byte budget",
                    name, self.config.max_total_bytes
                )));
            }

            let mut waiting_hashes: HashSet<String> = record
                .items
                .iter()
                .filter(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Processing))
                .map(|i| i.content_hash.clone())
                .collect();

            let now = Utc::now();
            let mut added = Vec::new();
            for file in files {
                let hash = hash_bytes(&file.data);
                if !waiting_hashes.insert(hash.clone()) {
                    tracing::debug!(
                        "Skipping duplicate upload '{}' (hash {})",
                        file.filename,
                        &hash[..12]
                    );
                    continue;
                }
                let item = QueueItem {
                    id: Uuid::new_v4(),
                    position: record.items.len(),
                    filename: file.filename,
                    size_bytes: file.data.len() as u64,
                    content_hash: hash,
                    status: ItemStatus::Pending,
                    attempts: 0,
                    error: None,
                    created_at: now,
                    updated_at: now,
                    data: file.data,
                };
                record.items.push(item.clone());
                added.push(item);
            }
            record.updated_at = now;
            (added, record.clone())
        };

        self.persist(&key, &record);
        tracing::info!(
            "Added {} item(s) to queue '{}' for user {}",
            added.len(),
            name,
            user_id
        );
        Ok(added)
    }

    /// Move a pending item to a new position; all positions are recomputed
    pub fn reorder(
        &self,
        user_id: &str,
        name: &str,
        item_id: Uuid,
        new_position: usize,
    ) -> Result<()> {
        let key = (user_id.to_string(), name.to_string());
        let record = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;

            let index = record
                .items
                .iter()
                .position(|i| i.id == item_id)
                .ok_or_else(|| Error::Validation(format!("unknown item {}", item_id)))?;
            if record.items[index].status != ItemStatus::Pending {
                return Err(Error::Validation(
                    "only pending items can be reordered".into(),
                ));
            }

            let item = record.items.remove(index);
            let target = new_position.min(record.items.len());
            record.items.insert(target, item);
            Self::recompute_positions(record);
            record.updated_at = Utc::now();
            record.clone()
        };
        self.persist(&key, &record);
        Ok(())
    }

    /// Stop handing out new items; in-flight items are not interrupted
    pub fn pause(&self, user_id: &str, name: &str) -> Result<()> {
        self.set_paused(user_id, name, true)
    }

    /// Resume handing out items
    pub fn resume(&self, user_id: &str, name: &str) -> Result<()> {
        self.set_paused(user_id, name, false)
    }

    /// Hand the lowest-positioned pending item to a consumer, marking it
    /// processing. Returns `None` while the queue is paused or drained.
    pub fn next_pending(&self, user_id: &str, name: &str) -> Result<Option<QueueItem>> {
        let key = (user_id.to_string(), name.to_string());
        let (item, record) = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;
            if record.paused {
                return Ok(None);
            }
            let next = record
                .items
                .iter_mut()
                .filter(|i| i.status == ItemStatus::Pending)
                .min_by_key(|i| i.position);
            match next {
                Some(item) => {
                    item.status = ItemStatus::Processing;
                    item.attempts += 1;
                    item.updated_at = Utc::now();
                    let item = item.clone();
                    record.updated_at = Utc::now();
                    (item, record.clone())
                }
                None => return Ok(None),
            }
        };
        self.persist(&key, &record);
        Ok(Some(item))
    }

    /// Mark an item completed and drop its in-memory bytes
    pub fn mark_completed(&self, user_id: &str, name: &str, item_id: Uuid) -> Result<()> {
        self.finish_item(user_id, name, item_id, ItemStatus::Completed, None)
    }

    /// Mark an item failed, recording the error.
    ///
    /// File bytes are kept so `retry_failed` can re-queue the item.
    pub fn mark_failed(
        &self,
        user_id: &str,
        name: &str,
        item_id: Uuid,
        error: impl Into<String>,
    ) -> Result<()> {
        self.finish_item(user_id, name, item_id, ItemStatus::Failed, Some(error.into()))
    }

    /// Return all failed items to pending; returns how many were reset
    pub fn retry_failed(&self, user_id: &str, name: &str) -> Result<usize> {
        let key = (user_id.to_string(), name.to_string());
        let (reset, record) = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;
            let now = Utc::now();
            let mut reset = 0;
            for item in record.items.iter_mut() {
                if item.status == ItemStatus::Failed {
                    item.status = ItemStatus::Pending;
                    item.error = None;
                    item.updated_at = now;
                    reset += 1;
                }
            }
            record.updated_at = now;
            (reset, record.clone())
        };
        if reset > 0 {
            self.persist(&key, &record);
        }
        Ok(reset)
    }

    /// Purge completed and failed items and compact positions
    pub fn cleanup(&self, user_id: &str, name: &str) -> Result<usize> {
        let key = (user_id.to_string(), name.to_string());
        let (removed, record) = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;
            let before = record.items.len();
            record
                .items
                .retain(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Processing));
            Self::recompute_positions(record);
            record.updated_at = Utc::now();
            (before - record.items.len(), record.clone())
        };
        self.persist(&key, &record);
        tracing::info!(
            "Cleaned up {} item(s) from queue '{}' for user {}",
            removed,
            name,
            user_id
        );
        Ok(removed)
    }

    /// Queue view without file bytes
    pub fn status(&self, user_id: &str, name: &str) -> Option<QueueStatus> {
        let queues = self.queues.read();
        queues
            .get(&(user_id.to_string(), name.to_string()))
            .map(Self::status_of)
    }

    /// File bytes for an item, when still held in memory
    pub fn item_data(&self, user_id: &str, name: &str, item_id: Uuid) -> Option<Vec<u8>> {
        let queues = self.queues.read();
        queues
            .get(&(user_id.to_string(), name.to_string()))
            .and_then(|record| record.items.iter().find(|i| i.id == item_id))
            .filter(|item| !item.data.is_empty())
            .map(|item| item.data.clone())
    }

    /// Spawn the auto-save task re-persisting recently mutated queues
    pub fn start_autosave(&self) {
        let queues = Arc::clone(&self.queues);
        let dirty = Arc::clone(&self.dirty);
        let store = Arc::clone(&self.store);
        let mut shutdown = self.shutdown.subscribe();
        let interval = std::time::Duration::from_secs(self.config.autosave_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::flush_dirty(&queues, &dirty, store.as_ref());
                    }
                    _ = shutdown.changed() => {
                        Self::flush_dirty(&queues, &dirty, store.as_ref());
                        break;
                    }
                }
            }
        });
        *self.autosave_task.lock() = Some(handle);
    }

    /// Final auto-save pass, then stop the task
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.autosave_task.lock().take() {
            let _ = handle.await;
        }
    }

    fn flush_dirty(
        queues: &RwLock<HashMap<QueueKey, QueueRecord>>,
        dirty: &Mutex<HashSet<QueueKey>>,
        store: &dyn QueueStore,
    ) {
        let keys: Vec<QueueKey> = dirty.lock().drain().collect();
        if keys.is_empty() {
            return;
        }
        let queues = queues.read();
        for key in keys {
            if let Some(record) = queues.get(&key) {
                if let Err(e) = store.write(record) {
                    tracing::error!(
                        "Auto-save failed for queue '{}' (user {}): {}",
                        key.1,
                        key.0,
                        e
                    );
                }
            }
        }
    }

    fn set_paused(&self, user_id: &str, name: &str, paused: bool) -> Result<()> {
        let key = (user_id.to_string(), name.to_string());
        let record = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;
            record.paused = paused;
            record.updated_at = Utc::now();
            record.clone()
        };
        self.persist(&key, &record);
        tracing::info!(
            "Queue '{}' for user {} {}",
            name,
            user_id,
            if paused { "paused" } else { "resumed" }
        );
        Ok(())
    }

    fn finish_item(
        &self,
        user_id: &str,
        name: &str,
        item_id: Uuid,
        status: ItemStatus,
        error: Option<String>,
    ) -> Result<()> {
        let key = (user_id.to_string(), name.to_string());
        let record = {
            let mut queues = self.queues.write();
            let record = queues
                .get_mut(&key)
                .ok_or_else(|| Error::Validation(format!("unknown queue '{}'", name)))?;
            let item = record
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or_else(|| Error::Validation(format!("unknown item {}", item_id)))?;
            item.status = status;
            item.error = error;
            item.updated_at = Utc::now();
            if status == ItemStatus::Completed {
                item.data = Vec::new();
            }
            record.updated_at = Utc::now();
            record.clone()
        };
        self.persist(&key, &record);
        Ok(())
    }

    /// Persist a queue, marking it dirty so auto-save retries on failure
    fn persist(&self, key: &QueueKey, record: &QueueRecord) {
        self.dirty.lock().insert(key.clone());
        if let Err(e) = self.store.write(record) {
            tracing::error!(
                "Failed to persist queue '{}' (user {}): {}",
                record.name,
                record.user_id,
                e
            );
        }
    }

    fn recompute_positions(record: &mut QueueRecord) {
        for (index, item) in record.items.iter_mut().enumerate() {
            item.position = index;
        }
    }

    fn status_of(record: &QueueRecord) -> QueueStatus {
        let count = |status: ItemStatus| record.items.iter().filter(|i| i.status == status).count();
        QueueStatus {
            id: record.id,
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            paused: record.paused,
            pending: count(ItemStatus::Pending),
            processing: count(ItemStatus::Processing),
            completed: count(ItemStatus::Completed),
            failed: count(ItemStatus::Failed),
            items: record
                .items
                .iter()
                .map(|item| QueueItem {
                    data: Vec::new(),
                    ..item.clone()
                })
                .collect(),
        }
    }
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteQueueStore;

    fn manager() -> UploadQueueManager {
        let store = Arc::new(SqliteQueueStore::in_memory().unwrap());
        UploadQueueManager::new(
            UploadConfig {
                max_file_bytes: 1024,
                max_total_bytes: 4096,
                autosave_interval_secs: 60,
            },
            store,
        )
    }

    fn file(name: &str, content: &[u8]) -> UploadFile {
        UploadFile {
            filename: name.to_string(),
            data: content.to_vec(),
        }
    }

    #[test]
    fn test_create_and_add_items() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        let added = manager
            .add_items(
                "alice",
                "reports",
                vec![file("a.pdf", b"aaa"), file("b.pdf", b"bbb")],
            )
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].position, 0);
        assert_eq!(added[1].position, 1);

        let status = manager.status("alice", "reports").unwrap();
        assert_eq!(status.pending, 2);
    }

    #[test]
    fn test_duplicate_hash_skipped() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        let added = manager
            .add_items(
                "alice",
                "reports",
                vec![file("a.pdf", b"same"), file("copy-of-a.pdf", b"same")],
            )
            .unwrap();
        assert_eq!(added.len(), 1);
    }

    #[test]
    fn test_size_limits() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();

        let err = manager
            .add_items("alice", "reports", vec![file("big.bin", &[0u8; 2048])])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Four distinct near-limit files blow the aggregate budget
        let files: Vec<UploadFile> = (0..5)
            .map(|i| {
                let mut data = vec![i as u8; 1000];
                data[0] = i as u8 + 1;
                UploadFile {
                    filename: format!("f{}.bin", i),
                    data,
                }
            })
            .collect();
        let err = manager.add_items("alice", "reports", files).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_reorder_pending_only() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        let added = manager
            .add_items(
                "alice",
                "reports",
                vec![file("a", b"a"), file("b", b"b"), file("c", b"c")],
            )
            .unwrap();

        manager.reorder("alice", "reports", added[2].id, 0).unwrap();
        let status = manager.status("alice", "reports").unwrap();
        let names: Vec<&str> = status.items.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        let positions: Vec<usize> = status.items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);

        // Items that already started cannot move
        let first = manager.next_pending("alice", "reports").unwrap().unwrap();
        let err = manager.reorder("alice", "reports", first.id, 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_pause_blocks_dequeue_but_not_inflight() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        manager
            .add_items("alice", "reports", vec![file("a", b"a"), file("b", b"b")])
            .unwrap();

        let inflight = manager.next_pending("alice", "reports").unwrap().unwrap();
        manager.pause("alice", "reports").unwrap();
        assert!(manager.next_pending("alice", "reports").unwrap().is_none());

        // The in-flight item still completes normally
        manager
            .mark_completed("alice", "reports", inflight.id)
            .unwrap();
        manager.resume("alice", "reports").unwrap();
        assert!(manager.next_pending("alice", "reports").unwrap().is_some());
    }

    #[test]
    fn test_cleanup_purges_terminal_items() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        manager
            .add_items(
                "alice",
                "reports",
                vec![file("a", b"a"), file("b", b"b"), file("c", b"c")],
            )
            .unwrap();

        let a = manager.next_pending("alice", "reports").unwrap().unwrap();
        manager.mark_completed("alice", "reports", a.id).unwrap();
        let b = manager.next_pending("alice", "reports").unwrap().unwrap();
        manager
            .mark_failed("alice", "reports", b.id, "extraction failed")
            .unwrap();

        let removed = manager.cleanup("alice", "reports").unwrap();
        assert_eq!(removed, 2);
        let status = manager.status("alice", "reports").unwrap();
        assert_eq!(status.items.len(), 1);
        assert_eq!(status.items[0].position, 0);
    }

    #[test]
    fn test_retry_failed_requeues_with_data() {
        let manager = manager();
        manager.create_queue("alice", "reports").unwrap();
        manager
            .add_items("alice", "reports", vec![file("a", b"payload")])
            .unwrap();

        let item = manager.next_pending("alice", "reports").unwrap().unwrap();
        manager
            .mark_failed("alice", "reports", item.id, "embedding timed out")
            .unwrap();

        assert_eq!(manager.retry_failed("alice", "reports").unwrap(), 1);
        let retried = manager.next_pending("alice", "reports").unwrap().unwrap();
        assert_eq!(retried.id, item.id);
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.data, b"payload");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store = Arc::new(SqliteQueueStore::in_memory().unwrap());
        let config = UploadConfig::default();

        let manager = UploadQueueManager::new(config.clone(), Arc::clone(&store) as Arc<dyn QueueStore>);
        manager.create_queue("alice", "reports").unwrap();
        manager
            .add_items("alice", "reports", vec![file("a.pdf", b"abc")])
            .unwrap();
        let taken = manager.next_pending("alice", "reports").unwrap().unwrap();

        // A second manager over the same store sees the queue; the in-flight
        // item is returned to pending
        let restored = UploadQueueManager::new(config, store);
        assert_eq!(restored.load_persisted().unwrap(), 1);
        let status = restored.status("alice", "reports").unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.items[0].id, taken.id);
        assert_eq!(status.items[0].content_hash, taken.content_hash);
    }
}
