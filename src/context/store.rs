//! Durable key/value collaborators for context snapshots.
//!
//! The substrate only needs a store shaped like `put(key, value, ttl)` /
//! `get(key)` / `delete(key)`. [`MemoryStore`] backs tests and single-node
//! deployments; [`SqliteStore`] persists across restarts with the same
//! TTL semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::debug;

use crate::error::{MeshError, Result};

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Store a value. A TTL of `None` means the entry never expires.
    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Fetch a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a value. No-op if absent.
    async fn delete(&self, key: &str) -> Result<()>;
}

pub type SharedContextStore = Arc<dyn ContextStore>;

// ============================================================================
// In-memory backend
// ============================================================================

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|e| Instant::now() > e).unwrap_or(false)
    }
}

/// In-process store with TTL expiry, the default and test backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ============================================================================
// Sqlite backend
// ============================================================================

/// Sqlite-backed store: one key/value table with an `expires_at` column.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MeshError::Storage(format!("Failed to create store dir: {}", e)))?;
        }

        let conn = Connection::open(&db_path)
            .map_err(|e| MeshError::Storage(format!("Failed to open store: {}", e)))?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires
                ON kv_entries(expires_at);
            ",
        )
        .map_err(|e| MeshError::Storage(format!("Failed to init store schema: {}", e)))?;
        Ok(())
    }

    /// Delete rows past their expiry. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![&now],
            )
            .map_err(|e| MeshError::Storage(format!("Failed to cleanup expired: {}", e)))?;

        if deleted > 0 {
            debug!(deleted, "Cleaned up expired store entries");
        }
        Ok(deleted)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl ContextStore for SqliteStore {
    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let expires_at: Option<String> = match ttl_seconds {
            Some(secs) => {
                let deadline = Utc::now()
                    + chrono::Duration::from_std(Duration::from_secs(secs))
                        .map_err(|e| MeshError::Storage(format!("Invalid TTL: {}", e)))?;
                Some(deadline.to_rfc3339())
            }
            None => None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at],
        )
        .map_err(|e| MeshError::Storage(format!("Failed to put {}: {}", key, e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };

        if let Some(deadline) = expires_at {
            let expired = DateTime::parse_from_rfc3339(&deadline)
                .map(|dt| dt.with_timezone(&Utc) < Utc::now())
                .unwrap_or(false);
            if expired {
                let _ = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key]);
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .map_err(|e| MeshError::Storage(format!("Failed to delete {}: {}", key, e)))?;
        Ok(())
    }
}
