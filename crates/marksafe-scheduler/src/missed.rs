//! Missed-work queue — bounded, priority-ordered list of deferred schedule
//! firings. Older firings rank higher; at capacity the lowest-priority
//! entries are evicted first.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use marksafe_core::error::Result;
use marksafe_core::traits::Clock;
use marksafe_core::types::{MissedBackupEntry, MissedBackupStats};

use crate::store::StateRepo;

pub struct MissedQueue {
    repo: StateRepo,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl MissedQueue {
    pub fn new(repo: StateRepo, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            repo,
            clock,
            capacity: capacity.max(1),
        }
    }

    /// Queue a deferred firing. A firing already queued for the same
    /// `(schedule_id, scheduled_time)` is returned instead of duplicated.
    ///
    /// Returns `None` when the queue is full of older firings and the new
    /// one ranks lowest, so it is dropped on arrival.
    pub async fn add_missed_backup(
        &self,
        schedule_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Result<Option<MissedBackupEntry>> {
        let _guard = self.repo.lock_missed().await;
        let now = self.clock.now();
        let mut entries = self.repo.load_missed().await?;

        if let Some(existing) = entries
            .iter()
            .find(|e| e.schedule_id == schedule_id && e.scheduled_time == scheduled_time)
        {
            tracing::debug!("📥 Firing {scheduled_time} for '{schedule_id}' already queued");
            let mut existing = existing.clone();
            existing.refresh_priority(now);
            return Ok(Some(existing));
        }

        let entry = MissedBackupEntry::new(schedule_id, scheduled_time, now);
        entries.push(entry.clone());
        sort_by_priority(&mut entries, now);
        let mut kept = true;
        if entries.len() > self.capacity {
            for evicted in entries.drain(self.capacity..) {
                kept &= evicted.id != entry.id;
                tracing::warn!(
                    "⚠️ Missed-work queue full; evicted firing {} for '{}' (priority {})",
                    evicted.scheduled_time,
                    evicted.schedule_id,
                    evicted.priority
                );
            }
        }
        self.repo.save_missed(&entries).await?;
        if !kept {
            tracing::warn!(
                "⚠️ Dropped missed backup for '{schedule_id}' at {scheduled_time}: queue full of older firings"
            );
            return Ok(None);
        }
        tracing::info!(
            "📥 Queued missed backup {} for '{schedule_id}' ({} queued)",
            entry.id,
            entries.len()
        );
        Ok(Some(entry))
    }

    /// Remove an entry by id. Returns whether anything was removed.
    pub async fn remove_missed_backup(&self, id: &str) -> Result<bool> {
        let _guard = self.repo.lock_missed().await;
        let mut entries = self.repo.load_missed().await?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.repo.save_missed(&entries).await?;
        Ok(true)
    }

    /// Queue contents, highest priority first, priorities refreshed to now.
    pub async fn get_missed_backups(&self) -> Result<Vec<MissedBackupEntry>> {
        let mut entries = self.repo.load_missed().await?;
        sort_by_priority(&mut entries, self.clock.now());
        Ok(entries)
    }

    /// The entry that would be processed next.
    pub async fn peek(&self) -> Result<Option<MissedBackupEntry>> {
        Ok(self.get_missed_backups().await?.into_iter().next())
    }

    pub async fn get_missed_backup_stats(&self) -> Result<MissedBackupStats> {
        let entries = self.get_missed_backups().await?;
        Ok(MissedBackupStats {
            count: entries.len(),
            oldest: entries.iter().map(|e| e.scheduled_time).min(),
            newest: entries.iter().map(|e| e.scheduled_time).max(),
            highest_priority: entries.iter().map(|e| e.priority).max(),
        })
    }
}

/// Refresh priorities and order highest first. Ties go to the older firing.
fn sort_by_priority(entries: &mut [MissedBackupEntry], now: DateTime<Utc>) {
    for entry in entries.iter_mut() {
        entry.refresh_priority(now);
    }
    entries.sort_by_key(|e| (Reverse(e.priority), e.scheduled_time));
}
