//! SQLite-backed persistence.
//!
//! One database carries two tables: `wa_auth`, a relational key-value table
//! for protocol credentials and key material, and `message_logs`, the
//! append-only audit log of inbound and outbound messages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use crate::types::{MessageRecord, MessageStatus};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS wa_auth (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_logs (
    id TEXT PRIMARY KEY,
    address TEXT NOT NULL,
    body TEXT,
    image_url TEXT,
    image_base64 TEXT,
    file_name TEXT,
    sender_name TEXT,
    sender_id TEXT,
    sender_photo_url TEXT,
    ordering_hint INTEGER,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_logs_created ON message_logs(created_at);
"#;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite connection wrapper.
///
/// rusqlite connections are not Sync, so all access is serialized through a
/// parking_lot mutex. Calls are short; holding the lock across them is fine.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::prepare(&conn)?;
        log::info!("database opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn prepare(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ---- key-value table ----

    /// Fetch a value by exact key.
    pub fn kv_get(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM wa_auth WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a value.
    pub fn kv_set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wa_auth (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, text],
        )?;
        Ok(())
    }

    /// Remove every record whose key starts with `prefix`, in one statement.
    pub fn kv_delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = format!("{}%", prefix);
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM wa_auth WHERE key LIKE ?1", [pattern])?;
        Ok(removed)
    }

    /// Count records under a key prefix.
    pub fn kv_count_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let pattern = format!("{}%", prefix);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM wa_auth WHERE key LIKE ?1",
            [pattern],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---- message log ----

    /// Append a message record. Records are never updated or deleted here;
    /// retention is an external concern.
    pub fn insert_message(&self, record: &MessageRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO message_logs
               (id, address, body, image_url, image_base64, file_name,
                sender_name, sender_id, sender_photo_url, ordering_hint,
                status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                record.id,
                record.address,
                record.body,
                record.image_url,
                record.image_base64,
                record.file_name,
                record.sender_name,
                record.sender_id,
                record.sender_photo_url,
                record.ordering_hint,
                record.status.as_str(),
                record.error,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent message records, newest first.
    pub fn recent_messages(&self, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, address, body, image_url, image_base64, file_name,
                    sender_name, sender_id, sender_photo_url, ordering_hint,
                    status, error, created_at
             FROM message_logs ORDER BY created_at DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<i64>>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, String>(12)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                id,
                address,
                body,
                image_url,
                image_base64,
                file_name,
                sender_name,
                sender_id,
                sender_photo_url,
                ordering_hint,
                status,
                error,
                created_at,
            ) = row?;
            records.push(MessageRecord {
                id,
                address,
                body,
                image_url,
                image_base64,
                file_name,
                sender_name,
                sender_id,
                sender_photo_url,
                ordering_hint,
                status: parse_status(&status)?,
                error,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(records)
    }

    /// Number of logged messages.
    pub fn message_count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM message_logs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn parse_status(raw: &str) -> StoreResult<MessageStatus> {
    match raw {
        "sent" => Ok(MessageStatus::Sent),
        "received" => Ok(MessageStatus::Received),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown message status: {other}"
        ))),
    }
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp: {e}")))
}
