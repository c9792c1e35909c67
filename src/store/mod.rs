//! Durable key-value store backed by SQLite.
//!
//! The credential layer treats persistence as an opaque store with three
//! logical keys: the credential record, the migration marker, and the
//! master key. Writes and deletes publish change notifications on a
//! broadcast channel so consumers can react to configuration changes
//! without polling.
//!
//! # Thread Safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - SQLite itself is thread-safe with serialized mode

use crate::error::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default key for the serialized credential record.
pub const CREDENTIAL_RECORD_KEY: &str = "credential_record";
/// Default key for the migration marker.
pub const MIGRATION_MARKER_KEY: &str = "migration_marker";
/// Default key for the persisted master key.
pub const MASTER_KEY_KEY: &str = "master_key";

/// Capacity of the change-notification channel. Slow subscribers that lag
/// behind miss events rather than blocking writers.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// What happened to a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Put,
    Delete,
}

/// A change notification for a single key.
#[derive(Clone, Debug)]
pub struct StoreChange {
    pub key: String,
    pub op: ChangeOp,
}

/// SQLite-backed key-value store with change notifications.
///
/// # Schema
/// ```sql
/// CREATE TABLE kv (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,
///     updated_at TEXT NOT NULL  -- ISO 8601 timestamp
/// );
/// ```
pub struct KvStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
}

impl KvStore {
    /// Creates or opens a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Creates an in-memory store (used in tests and health probes).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    /// Reads the value for a key, `None` if absent.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Writes (insert or overwrite) the value for a key and publishes a
    /// change notification.
    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"
                INSERT INTO kv (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, now],
            )?;
        }

        // No subscribers is fine
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            op: ChangeOp::Put,
        });
        Ok(())
    }

    /// Deletes a key. Returns true if a value existed. Publishes a change
    /// notification only when something was actually removed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?
        };

        if removed > 0 {
            let _ = self.changes.send(StoreChange {
                key: key.to_string(),
                op: ChangeOp::Delete,
            });
        }
        Ok(removed > 0)
    }

    /// Subscribes to change notifications for all keys.
    ///
    /// Receivers that fall more than the channel capacity behind observe
    /// `RecvError::Lagged` and miss the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let store = KvStore::open_in_memory().unwrap();

        assert!(store.get("missing").unwrap().is_none());

        store.put("credential_record", "{}").unwrap();
        assert_eq!(
            store.get("credential_record").unwrap().as_deref(),
            Some("{}")
        );

        // Overwrite
        store.put("credential_record", r#"{"a":1}"#).unwrap();
        assert_eq!(
            store.get("credential_record").unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
    }

    #[test]
    fn test_delete() {
        let store = KvStore::open_in_memory().unwrap();

        store.put("master_key", "abc").unwrap();
        assert!(store.delete("master_key").unwrap());
        assert!(store.get("master_key").unwrap().is_none());

        // Deleting again reports nothing removed
        assert!(!store.delete("master_key").unwrap());
    }

    #[test]
    fn test_on_disk_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = KvStore::open(&path).unwrap();
            store.put("credential_record", "persisted").unwrap();
        }

        let store = KvStore::open(&path).unwrap();
        assert_eq!(
            store.get("credential_record").unwrap().as_deref(),
            Some("persisted")
        );
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let store = KvStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        store.put("credential_record", "v").unwrap();
        store.delete("credential_record").unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "credential_record");
        assert_eq!(change.op, ChangeOp::Put);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.op, ChangeOp::Delete);
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_is_silent() {
        let store = KvStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        store.delete("never_written").unwrap();
        store.put("marker", "x").unwrap();

        // The first event observed is the put, not the no-op delete
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "marker");
    }
}
