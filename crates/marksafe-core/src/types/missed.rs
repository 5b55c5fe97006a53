//! Missed-work queue entries — schedule firings deferred for resource reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deferred schedule firing waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedBackupEntry {
    pub id: String,
    pub schedule_id: String,
    /// The occurrence that was skipped.
    pub scheduled_time: DateTime<Utc>,
    pub added_at: DateTime<Utc>,
    /// Minutes overdue as of the last refresh. Older firings rank higher.
    pub priority: i64,
}

impl MissedBackupEntry {
    pub fn new(schedule_id: &str, scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("missed-{}", uuid::Uuid::new_v4()),
            schedule_id: schedule_id.to_string(),
            scheduled_time,
            added_at: now,
            priority: priority_at(scheduled_time, now),
        }
    }

    /// Recompute the priority against `now`.
    pub fn refresh_priority(&mut self, now: DateTime<Utc>) {
        self.priority = priority_at(self.scheduled_time, now);
    }
}

/// Priority of a firing scheduled at `scheduled_time`, seen from `now`.
///
/// Firings in the future get 0. Monotonic in age, so an older
/// `scheduled_time` never ranks below a newer one.
pub fn priority_at(scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - scheduled_time).num_minutes().max(0)
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedBackupStats {
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub highest_priority: Option<i64>,
}
