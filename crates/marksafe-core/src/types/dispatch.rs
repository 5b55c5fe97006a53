//! Execution engine wire messages.
//!
//! ```text
//! → {"action":"scheduledBackup","scheduleId":"default","backupId":"backup-…","attempt":2}
//! ← {"status":"ok","backupId":"backup-…","bookmarkCount":812}
//! ← {"status":"error","error":"upload failed: 503"}
//! ```

use serde::{Deserialize, Serialize};

/// What the engine is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchAction {
    #[serde(rename = "scheduledBackup")]
    ScheduledBackup,
    #[serde(rename = "manualBackup")]
    ManualBackup,
}

/// A message handed to the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub action: DispatchAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl DispatchRequest {
    pub fn scheduled(schedule_id: &str, backup_id: &str, attempt: u32) -> Self {
        Self {
            action: DispatchAction::ScheduledBackup,
            schedule_id: Some(schedule_id.to_string()),
            backup_id: Some(backup_id.to_string()),
            attempt: Some(attempt),
        }
    }

    pub fn manual(backup_id: &str, attempt: u32) -> Self {
        Self {
            action: DispatchAction::ManualBackup,
            schedule_id: None,
            backup_id: Some(backup_id.to_string()),
            attempt: Some(attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// The engine's asynchronous answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_count: Option<u64>,
}

impl DispatchReply {
    pub fn ok(backup_id: Option<String>, bookmark_count: Option<u64>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            backup_id,
            error: None,
            bookmark_count,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            backup_id: None,
            error: Some(message.into()),
            bookmark_count: None,
        }
    }

    /// Only a clean `ok` counts; an `ok` carrying an error field is a failure.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok && self.error.is_none()
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("engine replied with status {:?}", self.status))
    }
}
