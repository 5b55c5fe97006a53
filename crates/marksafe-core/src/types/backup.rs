//! Backup records — one attempt chain of producing a backup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of attempts before a backup is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What started the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Scheduled,
}

/// Lifecycle state of a backup record.
///
/// `in_progress → success`, `in_progress → retry_pending → in_progress → …`,
/// or `→ failed` once attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Success,
    Failed,
    RetryPending,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Success | BackupStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
            BackupStatus::RetryPending => "retry_pending",
        }
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted backup attempt chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    /// 1-based attempt number, never above `max_attempts`.
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// When the chain was created.
    pub timestamp: DateTime<Utc>,
    /// Last status change; used to spot dispatches that never reported back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl BackupRecord {
    /// A fresh `in_progress` record on its first attempt.
    pub fn new(kind: BackupKind, schedule_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("backup-{}", uuid::Uuid::new_v4()),
            kind,
            status: BackupStatus::InProgress,
            schedule_id,
            attempt: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timestamp: now,
            updated_at: Some(now),
            next_retry_time: None,
            bookmark_count: None,
            last_error: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// `retry_pending` and its retry time has arrived.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == BackupStatus::RetryPending
            && self.next_retry_time.is_some_and(|t| t <= now)
    }

    /// Time of the last status change, falling back to creation time.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.timestamp)
    }
}
