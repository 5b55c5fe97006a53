//! Backup/retry ledger — the persisted list of backup records and the retry
//! state machine that moves them between states.
//!
//! ```text
//! in_progress ──ok──▶ success
//!      │
//!      └─fail─▶ retry_pending ──due──▶ in_progress ──▶ …
//!                     │
//!                     └─ attempt == max_attempts ─▶ failed
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use marksafe_core::config::RetryConfig;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::Clock;
use marksafe_core::types::{BackupKind, BackupRecord, BackupStatus, RETENTION_UNLIMITED};
use serde::Serialize;

use crate::store::StateRepo;

/// Outcome of [`BackupLedger::schedule_backup_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is queued; the record is `retry_pending`.
    Scheduled(BackupRecord),
    /// Attempts ran out; the record is `failed`.
    Exhausted(BackupRecord),
    /// The record was already terminal and is left as is.
    Settled(BackupRecord),
}

impl RetryDecision {
    pub fn record(&self) -> &BackupRecord {
        match self {
            Self::Scheduled(r) | Self::Exhausted(r) | Self::Settled(r) => r,
        }
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub total: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failed: usize,
    pub retry_pending: usize,
    pub manual: usize,
    pub scheduled: usize,
}

/// Backoff delay in minutes after failed attempt number `attempt` (1-based):
/// `min(base · 2^(attempt-1), max)`.
pub fn retry_delay_minutes(attempt: u32, base_delay_mins: u32, max_delay_mins: u32) -> i64 {
    let exponent = attempt.saturating_sub(1);
    let delay = 2u64
        .checked_pow(exponent)
        .and_then(|factor| factor.checked_mul(u64::from(base_delay_mins)))
        .unwrap_or(u64::MAX);
    delay.min(u64::from(max_delay_mins)) as i64
}

/// When the next attempt may run after failed attempt number `attempt`.
pub fn calculate_next_retry_time(
    attempt: u32,
    base_delay_mins: u32,
    max_delay_mins: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    now + Duration::minutes(retry_delay_minutes(attempt, base_delay_mins, max_delay_mins))
}

/// Owns every mutation of the `backups` collection.
///
/// Each method is one read-modify-write against the latest stored list,
/// done under the repo's `backups` lock, and touches a single record (or, for
/// retention, one schedule's records).
pub struct BackupLedger {
    repo: StateRepo,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl BackupLedger {
    pub fn new(repo: StateRepo, clock: Arc<dyn Clock>, retry: RetryConfig) -> Self {
        Self { repo, clock, retry }
    }

    /// Append a fresh `in_progress` record on its first attempt.
    pub async fn create_record(
        &self,
        kind: BackupKind,
        schedule_id: Option<&str>,
    ) -> Result<BackupRecord> {
        let record = BackupRecord::new(kind, schedule_id.map(str::to_string), self.clock.now())
            .with_max_attempts(self.retry.max_attempts);
        let _guard = self.repo.lock_backups().await;
        let mut backups = self.repo.load_backups().await?;
        backups.push(record.clone());
        self.repo.save_backups(&backups).await?;
        tracing::info!(
            "🗂️ Created {} backup {} (attempt 1/{})",
            kind_label(kind),
            record.id,
            record.max_attempts
        );
        Ok(record)
    }

    /// Move a record back to `in_progress` ahead of a retry dispatch.
    pub async fn mark_in_progress(&self, backup_id: &str) -> Result<BackupRecord> {
        let now = self.clock.now();
        self.update(backup_id, |record| {
            record.status = BackupStatus::InProgress;
            record.next_retry_time = None;
            record.updated_at = Some(now);
        })
        .await
    }

    /// Mark a record `success`.
    pub async fn complete(&self, backup_id: &str, bookmark_count: Option<u64>) -> Result<BackupRecord> {
        let now = self.clock.now();
        let record = self
            .update(backup_id, |record| {
                record.status = BackupStatus::Success;
                record.next_retry_time = None;
                record.last_error = None;
                record.updated_at = Some(now);
                if bookmark_count.is_some() {
                    record.bookmark_count = bookmark_count;
                }
            })
            .await?;
        tracing::info!(
            "✅ Backup {} succeeded on attempt {}/{}",
            record.id,
            record.attempt,
            record.max_attempts
        );
        Ok(record)
    }

    /// Queue another attempt for a failed record, or fail it for good.
    pub async fn schedule_backup_retry(&self, backup_id: &str) -> Result<RetryDecision> {
        self.retry_with_error(backup_id, None).await
    }

    /// Store the failure reason, then apply [`Self::schedule_backup_retry`]
    /// in the same write.
    pub async fn record_failure(&self, backup_id: &str, error: &str) -> Result<RetryDecision> {
        self.retry_with_error(backup_id, Some(error)).await
    }

    async fn retry_with_error(&self, backup_id: &str, error: Option<&str>) -> Result<RetryDecision> {
        let _guard = self.repo.lock_backups().await;
        let now = self.clock.now();
        let mut backups = self.repo.load_backups().await?;
        let Some(record) = backups.iter_mut().find(|r| r.id == backup_id) else {
            tracing::error!("❌ Cannot schedule retry: backup {backup_id} not found");
            return Err(MarkSafeError::BackupNotFound(backup_id.to_string()));
        };

        if record.status.is_terminal() {
            tracing::warn!(
                "⚠️ Backup {backup_id} is already {}; retry request ignored",
                record.status
            );
            return Ok(RetryDecision::Settled(record.clone()));
        }

        if let Some(error) = error {
            record.last_error = Some(error.to_string());
        }
        record.updated_at = Some(now);

        let decision = if record.has_attempts_left() {
            let failed_attempt = record.attempt;
            let next = calculate_next_retry_time(
                failed_attempt,
                self.retry.base_delay_mins,
                self.retry.max_delay_mins,
                now,
            );
            record.attempt += 1;
            record.status = BackupStatus::RetryPending;
            record.next_retry_time = Some(next);
            tracing::info!(
                "🔁 Backup {backup_id} attempt {failed_attempt} failed; attempt {}/{} at {next}",
                record.attempt,
                record.max_attempts
            );
            RetryDecision::Scheduled(record.clone())
        } else {
            record.status = BackupStatus::Failed;
            record.next_retry_time = None;
            tracing::error!(
                "❌ Backup {backup_id} failed after {} attempts: {}",
                record.attempt,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
            RetryDecision::Exhausted(record.clone())
        };

        self.repo.save_backups(&backups).await?;
        Ok(decision)
    }

    /// `retry_pending` records whose retry time has arrived.
    ///
    /// A store failure is logged and yields an empty list; the next tick tries
    /// again.
    pub async fn get_backups_due_for_retry(&self) -> Vec<BackupRecord> {
        let now = self.clock.now();
        match self.repo.load_backups().await {
            Ok(backups) => backups
                .into_iter()
                .filter(|r| r.is_due_for_retry(now))
                .collect(),
            Err(e) => {
                tracing::warn!("⚠️ Failed to load backups for retry check: {e}");
                Vec::new()
            }
        }
    }

    /// `in_progress` records untouched for longer than `max_age`: dispatches
    /// that never reported back.
    pub async fn stale_in_progress(&self, max_age: Duration) -> Vec<BackupRecord> {
        let cutoff = self.clock.now() - max_age;
        match self.repo.load_backups().await {
            Ok(backups) => backups
                .into_iter()
                .filter(|r| r.status == BackupStatus::InProgress && r.last_touched() < cutoff)
                .collect(),
            Err(e) => {
                tracing::warn!("⚠️ Failed to load backups for stale check: {e}");
                Vec::new()
            }
        }
    }

    /// Delete the oldest scheduled backups of `schedule_id` beyond
    /// `retention_count`. Returns how many were removed.
    ///
    /// Manual backups are never touched. `-1` keeps everything.
    pub async fn enforce_retention_policy(
        &self,
        schedule_id: &str,
        retention_count: i32,
    ) -> Result<usize> {
        if retention_count == RETENTION_UNLIMITED || retention_count < 0 {
            return Ok(0);
        }
        let keep = retention_count as usize;
        let _guard = self.repo.lock_backups().await;
        let mut backups = self.repo.load_backups().await?;

        let mut governed: Vec<(DateTime<Utc>, String)> = backups
            .iter()
            .filter(|r| r.kind == BackupKind::Scheduled && r.schedule_id.as_deref() == Some(schedule_id))
            .map(|r| (r.timestamp, r.id.clone()))
            .collect();
        if governed.len() <= keep {
            return Ok(0);
        }
        governed.sort();
        let excess = governed.len() - keep;
        let doomed: Vec<String> = governed.into_iter().take(excess).map(|(_, id)| id).collect();

        backups.retain(|r| !doomed.contains(&r.id));
        self.repo.save_backups(&backups).await?;
        tracing::info!(
            "🧹 Retention for '{schedule_id}': removed {excess} old backup(s), keeping {keep}"
        );
        Ok(excess)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .repo
            .load_backups()
            .await?
            .into_iter()
            .find(|r| r.id == backup_id))
    }

    pub async fn get_backups(&self) -> Result<Vec<BackupRecord>> {
        self.repo.load_backups().await
    }

    pub async fn ledger_summary(&self) -> Result<LedgerSummary> {
        let backups = self.repo.load_backups().await?;
        let mut summary = LedgerSummary {
            total: backups.len(),
            ..Default::default()
        };
        for record in &backups {
            match record.status {
                BackupStatus::InProgress => summary.in_progress += 1,
                BackupStatus::Success => summary.success += 1,
                BackupStatus::Failed => summary.failed += 1,
                BackupStatus::RetryPending => summary.retry_pending += 1,
            }
            match record.kind {
                BackupKind::Manual => summary.manual += 1,
                BackupKind::Scheduled => summary.scheduled += 1,
            }
        }
        Ok(summary)
    }

    async fn update<F>(&self, backup_id: &str, apply: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let _guard = self.repo.lock_backups().await;
        let mut backups = self.repo.load_backups().await?;
        let Some(record) = backups.iter_mut().find(|r| r.id == backup_id) else {
            tracing::error!("❌ Backup {backup_id} not found in ledger");
            return Err(MarkSafeError::BackupNotFound(backup_id.to_string()));
        };
        apply(record);
        let updated = record.clone();
        self.repo.save_backups(&backups).await?;
        Ok(updated)
    }
}

fn kind_label(kind: BackupKind) -> &'static str {
    match kind {
        BackupKind::Manual => "manual",
        BackupKind::Scheduled => "scheduled",
    }
}
