//! Key-value state stores and the typed repository on top of them.
//! JSON files are one per key — human-readable, easy to inspect by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::{KEY_BACKUPS, KEY_MISSED_BACKUPS, KEY_SCHEDULE, StateStore};
use marksafe_core::types::{BackupRecord, MissedBackupEntry, Schedule};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Volatile store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// One pretty-printed JSON file per key under a directory.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn file_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(MarkSafeError::store(format!("invalid key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    fn name(&self) -> &str {
        "json"
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let file = self.file_for(key)?;
        let text = match tokio::fs::read_to_string(&file).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MarkSafeError::store(format!(
                    "read {}: {e}",
                    file.display()
                )));
            }
        };
        let value = serde_json::from_str(&text)
            .map_err(|e| MarkSafeError::store(format!("parse {}: {e}", file.display())))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let file = self.file_for(key)?;
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| MarkSafeError::store(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|e| MarkSafeError::store(format!("rename to {}: {e}", file.display())))?;
        tracing::debug!("💾 Saved '{key}' to {}", file.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let file = self.file_for(key)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MarkSafeError::store(format!(
                "remove {}: {e}",
                file.display()
            ))),
        }
    }
}

// ─── Typed access ────────────────────────────────────────

/// Typed reads and writes of the three persisted keys.
///
/// Every operation goes straight to the store; nothing is cached, so each
/// read sees the latest write from any component.
///
/// Clones share one write lock per key. A read-modify-write holds the key's
/// lock from load to save so concurrent tasks in this process cannot save
/// over each other's changes. Plain reads take no lock.
#[derive(Clone)]
pub struct StateRepo {
    store: Arc<dyn StateStore>,
    locks: Arc<KeyLocks>,
}

#[derive(Default)]
struct KeyLocks {
    schedule: Mutex<()>,
    backups: Mutex<()>,
    missed: Mutex<()>,
}

impl StateRepo {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Exclusive write access to `schedule` until the guard drops.
    pub async fn lock_schedule(&self) -> MutexGuard<'_, ()> {
        self.locks.schedule.lock().await
    }

    /// Exclusive write access to `backups` until the guard drops.
    pub async fn lock_backups(&self) -> MutexGuard<'_, ()> {
        self.locks.backups.lock().await
    }

    /// Exclusive write access to `missedBackups` until the guard drops.
    pub async fn lock_missed(&self) -> MutexGuard<'_, ()> {
        self.locks.missed.lock().await
    }

    /// The stored schedule, or the default (disabled, daily 02:00) if none.
    pub async fn load_schedule(&self) -> Result<Schedule> {
        Ok(self.read(KEY_SCHEDULE).await?.unwrap_or_default())
    }

    pub async fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.write(KEY_SCHEDULE, schedule).await
    }

    pub async fn load_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.read(KEY_BACKUPS).await?.unwrap_or_default())
    }

    pub async fn save_backups(&self, backups: &[BackupRecord]) -> Result<()> {
        self.write(KEY_BACKUPS, backups).await
    }

    pub async fn load_missed(&self) -> Result<Vec<MissedBackupEntry>> {
        Ok(self.read(KEY_MISSED_BACKUPS).await?.unwrap_or_default())
    }

    pub async fn save_missed(&self, entries: &[MissedBackupEntry]) -> Result<()> {
        self.write(KEY_MISSED_BACKUPS, entries).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.store.set(key, serde_json::to_value(value)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marksafe_core::types::{BackupKind, Frequency};

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap()["a"], 1);
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.set("schedule", serde_json::json!({"enabled": true})).await.unwrap();
        }
        let store = JsonFileStore::open(dir.path()).unwrap();
        let value = store.get("schedule").await.unwrap().unwrap();
        assert_eq!(value["enabled"], true);
        assert!(dir.path().join("schedule.json").exists());
        assert!(!dir.path().join(".schedule.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.set("", serde_json::Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("backups.json"), "{not json").unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let err = store.get("backups").await.unwrap_err();
        assert!(matches!(err, MarkSafeError::Store(_)));
    }

    #[tokio::test]
    async fn test_repo_defaults_when_absent() {
        let repo = StateRepo::new(Arc::new(MemoryStore::new()));
        let schedule = repo.load_schedule().await.unwrap();
        assert!(!schedule.enabled);
        assert_eq!(schedule.frequency, Frequency::Daily);
        assert!(repo.load_backups().await.unwrap().is_empty());
        assert!(repo.load_missed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repo_round_trips_records() {
        let repo = StateRepo::new(Arc::new(MemoryStore::new()));
        let rec = BackupRecord::new(BackupKind::Manual, None, Utc::now());
        repo.save_backups(std::slice::from_ref(&rec)).await.unwrap();
        let loaded = repo.load_backups().await.unwrap();
        assert_eq!(loaded, vec![rec]);
    }
}
