//! Schedule definitions — when recurring backups should happen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention value meaning "keep every scheduled backup".
pub const RETENTION_UNLIMITED: i32 = -1;

/// Retention counts a schedule may carry.
pub const RETENTION_OPTIONS: [i32; 5] = [RETENTION_UNLIMITED, 5, 10, 20, 50];

/// Id given to the single schedule when none is stored.
pub const DEFAULT_SCHEDULE_ID: &str = "default";

/// How often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Biweekly,
        Frequency::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
        }
    }

    /// Whether this frequency is anchored to a weekday.
    pub fn uses_day_of_week(&self) -> bool {
        matches!(self, Frequency::Weekly | Frequency::Biweekly)
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" | "bi-weekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

/// The persisted backup schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default = "default_schedule_id")]
    pub id: String,
    pub enabled: bool,
    pub frequency: Frequency,
    /// Hour of day, 0-23 (local time).
    pub hour: u8,
    /// Minute of hour, 0-59.
    pub minute: u8,
    /// 0 = Sunday … 6 = Saturday. Used by weekly and biweekly schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    /// 1-31. Clamped to the month's last day when the month is shorter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    #[serde(default = "default_retention_count")]
    pub retention_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_backup_time: Option<DateTime<Utc>>,
}

fn default_schedule_id() -> String {
    DEFAULT_SCHEDULE_ID.into()
}
fn default_retention_count() -> i32 {
    10
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            id: default_schedule_id(),
            enabled: false,
            frequency: Frequency::Daily,
            hour: 2,
            minute: 0,
            day_of_week: None,
            day_of_month: None,
            retention_count: default_retention_count(),
            last_backup_time: None,
            next_backup_time: None,
        }
    }
}

impl Schedule {
    /// A schedule fires when it is enabled and its next occurrence has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_backup_time.is_some_and(|next| next <= now)
    }

    /// Whether retention is unlimited for this schedule.
    pub fn keeps_everything(&self) -> bool {
        self.retention_count == RETENTION_UNLIMITED
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        match self.frequency {
            Frequency::Hourly => write!(f, "hourly at :{:02}", self.minute),
            Frequency::Daily => write!(f, "daily at {:02}:{:02}", self.hour, self.minute),
            Frequency::Weekly | Frequency::Biweekly => {
                let day = self
                    .day_of_week
                    .and_then(|d| DAYS.get(d as usize))
                    .copied()
                    .unwrap_or("?");
                write!(
                    f,
                    "{} on {} at {:02}:{:02}",
                    self.frequency, day, self.hour, self.minute
                )
            }
            Frequency::Monthly => write!(
                f,
                "monthly on day {} at {:02}:{:02}",
                self.day_of_month.unwrap_or(1),
                self.hour,
                self.minute
            ),
        }
    }
}

/// Unvalidated schedule fields as they arrive from a user or settings file.
///
/// Numbers are kept wide and the frequency as text so out-of-range input
/// reaches validation instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub enabled: bool,
    pub frequency: String,
    pub hour: i64,
    pub minute: i64,
    #[serde(default)]
    pub day_of_week: Option<i64>,
    #[serde(default)]
    pub day_of_month: Option<i64>,
    pub retention_count: i64,
}

impl From<&Schedule> for ScheduleInput {
    fn from(s: &Schedule) -> Self {
        Self {
            enabled: s.enabled,
            frequency: s.frequency.as_str().to_string(),
            hour: i64::from(s.hour),
            minute: i64::from(s.minute),
            day_of_week: s.day_of_week.map(i64::from),
            day_of_month: s.day_of_month.map(i64::from),
            retention_count: i64::from(s.retention_count),
        }
    }
}
