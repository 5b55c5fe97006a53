//! Persistent store trait — an async key-value store without transactions.

use async_trait::async_trait;

use crate::error::Result;

/// Key holding the single [`Schedule`](crate::types::Schedule).
pub const KEY_SCHEDULE: &str = "schedule";
/// Key holding the list of [`BackupRecord`](crate::types::BackupRecord)s.
pub const KEY_BACKUPS: &str = "backups";
/// Key holding the list of [`MissedBackupEntry`](crate::types::MissedBackupEntry)s.
pub const KEY_MISSED_BACKUPS: &str = "missedBackups";

/// Async key-value persistence.
///
/// There is no locking and no transaction: concurrent writers race and the
/// last write wins. Callers read the latest value, change one thing, and
/// write it straight back.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Read a value. `None` when the key was never written.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Overwrite a value.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
