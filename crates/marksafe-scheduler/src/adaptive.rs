//! Adaptive scheduler — decides whether a due backup runs now or is parked
//! in the missed-work queue, and replays parked firings one at a time.

use std::future::Future;
use std::sync::Arc;

use marksafe_core::error::Result;
use marksafe_core::traits::Clock;
use marksafe_core::types::{MissedBackupEntry, MissedBackupStats, Schedule, SystemStateSnapshot};
use serde::Serialize;

use crate::missed::MissedQueue;
use crate::resource::{OperationRequirements, ResourceMonitor};
use crate::store::StateRepo;
use crate::time_calc::calculate_next_backup_time;

pub const REASON_QUEUE_EMPTY: &str = "No missed backups in queue";

/// Whether a due backup should wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferDecision {
    pub should_defer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub system_state: SystemStateSnapshot,
}

/// Result of one missed-queue drain step.
#[derive(Debug, Clone, PartialEq)]
pub enum MissedOutcome {
    /// The entry was launched and removed from the queue.
    Processed(MissedBackupEntry),
    /// Nothing queued.
    Empty,
    /// The device is not fit; the queue is untouched.
    Blocked {
        reason: String,
        system_state: SystemStateSnapshot,
    },
}

impl MissedOutcome {
    pub fn processed(&self) -> bool {
        matches!(self, Self::Processed(_))
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Processed(_) => None,
            Self::Empty => Some(REASON_QUEUE_EMPTY.to_string()),
            Self::Blocked { reason, .. } => Some(format!("Cannot process missed backups: {reason}")),
        }
    }
}

pub struct AdaptiveScheduler {
    monitor: Arc<ResourceMonitor>,
    queue: MissedQueue,
    repo: StateRepo,
    clock: Arc<dyn Clock>,
    requirements: OperationRequirements,
}

impl AdaptiveScheduler {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        queue: MissedQueue,
        repo: StateRepo,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            monitor,
            queue,
            repo,
            clock,
            requirements: OperationRequirements::default(),
        }
    }

    pub fn queue(&self) -> &MissedQueue {
        &self.queue
    }

    pub async fn should_defer_backup(&self) -> DeferDecision {
        let check = self.monitor.can_perform_operation(self.requirements).await;
        DeferDecision {
            should_defer: !check.is_safe,
            reason: check.reason,
            system_state: check.system_state,
        }
    }

    /// Park the schedule's due firing and move `next_backup_time` on so the
    /// scheduled check does not fire it again straight away.
    ///
    /// The entry is `None` when a full queue dropped the firing; the schedule
    /// still moves on.
    pub async fn defer_backup(&self, schedule: &Schedule) -> Result<Option<MissedBackupEntry>> {
        let now = self.clock.now();
        let scheduled_time = schedule.next_backup_time.unwrap_or(now);
        let entry = self.queue.add_missed_backup(&schedule.id, scheduled_time).await?;

        // Re-read so a concurrent schedule edit is not overwritten wholesale.
        let _guard = self.repo.lock_schedule().await;
        let mut latest = self.repo.load_schedule().await?;
        if latest.id == schedule.id && latest.enabled {
            let next = calculate_next_backup_time(&latest, now);
            latest.next_backup_time = Some(next);
            self.repo.save_schedule(&latest).await?;
            tracing::info!("⏸️ Deferred backup for '{}'; next run at {next}", schedule.id);
        }
        Ok(entry)
    }

    /// Replay at most one parked firing.
    ///
    /// `launch` starts the backup for the entry; the entry leaves the queue
    /// only after `launch` succeeds.
    pub async fn process_next_missed_backup<F, Fut>(&self, launch: F) -> Result<MissedOutcome>
    where
        F: FnOnce(MissedBackupEntry) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Some(entry) = self.queue.peek().await? else {
            tracing::debug!("📭 {REASON_QUEUE_EMPTY}");
            return Ok(MissedOutcome::Empty);
        };

        let check = self.monitor.can_perform_operation(self.requirements).await;
        if !check.is_safe {
            let reason = check
                .reason
                .unwrap_or_else(|| check.system_state.reason.clone());
            tracing::warn!("⚠️ Cannot process missed backups: {reason}");
            return Ok(MissedOutcome::Blocked {
                reason,
                system_state: check.system_state,
            });
        }

        launch(entry.clone()).await?;
        self.queue.remove_missed_backup(&entry.id).await?;
        tracing::info!(
            "▶️ Replayed missed backup {} for '{}' (scheduled {})",
            entry.id,
            entry.schedule_id,
            entry.scheduled_time
        );
        Ok(MissedOutcome::Processed(entry))
    }

    pub async fn get_missed_backups(&self) -> Result<Vec<MissedBackupEntry>> {
        self.queue.get_missed_backups().await
    }

    pub async fn get_missed_backup_stats(&self) -> Result<MissedBackupStats> {
        self.queue.get_missed_backup_stats().await
    }
}
