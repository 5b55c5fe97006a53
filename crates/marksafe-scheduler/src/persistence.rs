//! SQLite-backed state store.
//! One `state` table of JSON values keyed by name — survives restarts and
//! keeps every key in a single file.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::StateStore;
use rusqlite::{Connection, OptionalExtension};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| MarkSafeError::store(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    /// In-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MarkSafeError::store(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,       -- JSON document
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| MarkSafeError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MarkSafeError::store(format!("DB lock poisoned: {e}")))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock()?;
        let text: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| MarkSafeError::store(format!("DB read '{key}': {e}")))?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value.to_string(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| MarkSafeError::store(format!("DB write '{key}': {e}")))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM state WHERE key = ?1", [key])
            .map_err(|e| MarkSafeError::store(format!("DB delete '{key}': {e}")))?;
        Ok(())
    }
}
