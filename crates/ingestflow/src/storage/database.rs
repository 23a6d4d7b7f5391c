//! SQLite-backed durable storage for upload queues
//!
//! One row per queue, keyed by queue id, holding the full item list as JSON.
//! Queues are written on every mutation and reloaded wholesale at startup.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::upload::{QueueItem, QueueRecord};

/// Durable-store interface consumed by the upload queue manager
pub trait QueueStore: Send + Sync {
    /// Load every persisted queue
    fn read_all(&self) -> Result<Vec<QueueRecord>>;

    /// Write (insert or replace) one queue record
    fn write(&self, record: &QueueRecord) -> Result<()>;

    /// Delete one queue record
    fn delete(&self, id: &Uuid) -> Result<()>;
}

/// SQLite implementation of [`QueueStore`]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Persistence(format!("failed to open database: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Persistence(format!("failed to open in-memory database: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::Persistence(format!("failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upload_queues (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                paused INTEGER NOT NULL DEFAULT 0,
                items_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_upload_queues_user ON upload_queues(user_id);
        "#,
        )
        .map_err(|e| Error::Persistence(format!("failed to run migrations: {}", e)))?;

        Ok(())
    }
}

impl QueueStore for SqliteQueueStore {
    fn read_all(&self) -> Result<Vec<QueueRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, paused, items_json, created_at, updated_at
             FROM upload_queues",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, DateTime<Utc>>(5)?,
                row.get::<_, DateTime<Utc>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, user_id, name, paused, items_json, created_at, updated_at) = row?;
            let id = Uuid::parse_str(&id)
                .map_err(|e| Error::Persistence(format!("invalid queue id '{}': {}", id, e)))?;
            let items: Vec<QueueItem> = serde_json::from_str(&items_json)
                .map_err(|e| Error::Persistence(format!("corrupt item list for {}: {}", id, e)))?;
            records.push(QueueRecord {
                id,
                user_id,
                name,
                paused: paused != 0,
                items,
                created_at,
                updated_at,
            });
        }
        Ok(records)
    }

    fn write(&self, record: &QueueRecord) -> Result<()> {
        let items_json = serde_json::to_string(&record.items)
            .map_err(|e| Error::Persistence(format!("failed to encode item list: {}", e)))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO upload_queues
             (id, user_id, name, paused, items_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.user_id,
                record.name,
                record.paused as i64,
                items_json,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM upload_queues WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::ItemStatus;

    fn sample_record() -> QueueRecord {
        let now = Utc::now();
        QueueRecord {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            name: "reports".to_string(),
            paused: false,
            items: vec![QueueItem {
                id: Uuid::new_v4(),
                position: 0,
                filename: "a.pdf".to_string(),
                size_bytes: 3,
                content_hash: "abc123".to_string(),
                status: ItemStatus::Pending,
                attempts: 0,
                error: None,
                created_at: now,
                updated_at: now,
                data: b"abc".to_vec(),
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_write_and_read_all() {
        let store = SqliteQueueStore::in_memory().unwrap();
        let record = sample_record();
        store.write(&record).unwrap();

        let loaded = store.read_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, record.id);
        assert_eq!(loaded[0].items.len(), 1);
        assert_eq!(loaded[0].items[0].filename, "a.pdf");
        // File bytes are not part of the persisted layout
        assert!(loaded[0].items[0].data.is_empty());
    }

    #[test]
    fn test_write_replaces_existing() {
        let store = SqliteQueueStore::in_memory().unwrap();
        let mut record = sample_record();
        store.write(&record).unwrap();

        record.paused = true;
        record.items[0].status = ItemStatus::Completed;
        store.write(&record).unwrap();

        let loaded = store.read_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].paused);
        assert_eq!(loaded[0].items[0].status, ItemStatus::Completed);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.db");

        let record = sample_record();
        {
            let store = SqliteQueueStore::new(&path).unwrap();
            store.write(&record).unwrap();
        }

        let reopened = SqliteQueueStore::new(&path).unwrap();
        let loaded = reopened.read_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, record.id);
    }

    #[test]
    fn test_delete() {
        let store = SqliteQueueStore::in_memory().unwrap();
        let record = sample_record();
        store.write(&record).unwrap();
        store.delete(&record.id).unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }
}
