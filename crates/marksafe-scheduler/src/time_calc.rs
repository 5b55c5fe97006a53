//! Schedule time arithmetic.
//! Turns a [`Schedule`] into its next occurrence, and validates raw schedule
//! input field by field.
//!
//! Occurrences are computed on the local wall clock (a "03:00 daily" backup
//! runs at 03:00 where the user is) and stored as UTC.
//!
//! Monthly schedules clamp inside the month being evaluated: day 31 in
//! February lands on Feb 28/29. Biweekly schedules run on the weekly weekday
//! but never less than 14 days after the last backup.

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc,
};
use marksafe_core::error::{MarkSafeError, Result, ValidationErrors};
use marksafe_core::types::{Frequency, RETENTION_OPTIONS, Schedule, ScheduleInput};

/// Next occurrence of `schedule` strictly after `now`, on the local clock.
pub fn calculate_next_backup_time(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    next_backup_time_at(schedule, &now.with_timezone(&Local)).with_timezone(&Utc)
}

/// Next occurrence of `schedule` strictly after `now`, in `now`'s time zone.
pub fn next_backup_time_at<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let local_now = now.naive_local();
    let today = local_now.date();
    let at = wall_time(schedule.hour, schedule.minute);

    let naive = match schedule.frequency {
        Frequency::Hourly => {
            let this_hour = wall_time(local_now.hour() as u8, schedule.minute);
            let candidate = today.and_time(this_hour);
            if candidate > local_now {
                candidate
            } else {
                candidate + Duration::hours(1)
            }
        }
        Frequency::Daily => {
            let candidate = today.and_time(at);
            if candidate > local_now {
                candidate
            } else {
                candidate + Duration::days(1)
            }
        }
        Frequency::Weekly => next_weekday(schedule, today, at, local_now),
        Frequency::Biweekly => {
            let mut candidate = next_weekday(schedule, today, at, local_now);
            if let Some(last) = schedule.last_backup_time {
                let last = last.with_timezone(&tz).naive_local();
                if candidate - last < Duration::days(14) {
                    candidate += Duration::weeks(1);
                }
            }
            candidate
        }
        Frequency::Monthly => {
            let day = schedule.day_of_month.unwrap_or(1);
            let candidate = clamped_month_day(today.year(), today.month(), day).and_time(at);
            if candidate > local_now {
                candidate
            } else {
                let (year, month) = next_month(today.year(), today.month());
                clamped_month_day(year, month, day).and_time(at)
            }
        }
    };

    resolve_local(&tz, naive)
}

fn wall_time(hour: u8, minute: u8) -> NaiveTime {
    NaiveTime::from_hms_opt(u32::from(hour.min(23)), u32::from(minute.min(59)), 0)
        .unwrap_or_default()
}

fn next_weekday(
    schedule: &Schedule,
    today: NaiveDate,
    at: NaiveTime,
    local_now: NaiveDateTime,
) -> NaiveDateTime {
    let target = i64::from(schedule.day_of_week.unwrap_or(0).min(6));
    let current = i64::from(today.weekday().num_days_from_sunday());
    let days_ahead = (target - current).rem_euclid(7);
    let candidate = (today + Duration::days(days_ahead)).and_time(at);
    if candidate > local_now {
        candidate
    } else {
        candidate + Duration::weeks(1)
    }
}

/// `day` of the given month, pulled back to the month's last day if needed.
fn clamped_month_day(year: i32, month: u32, day: u8) -> NaiveDate {
    let day = u32::from(day.max(1)).min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Map a wall-clock time onto the zone. Ambiguous times take the earlier
/// instant; times skipped by a DST jump move forward to the next valid minute.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut probe = naive;
    for _ in 0..(3 * 60) {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => probe += Duration::minutes(1),
        }
    }
    tz.from_utc_datetime(&naive)
}

// ─── Validation ──────────────────────────────────────────

/// Outcome of [`validate_schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleValidation {
    pub is_valid: bool,
    pub errors: ValidationErrors,
}

/// Check every field of `input` independently; errors accumulate.
pub fn validate_schedule(input: &ScheduleInput) -> ScheduleValidation {
    let mut errors = ValidationErrors::new();

    let frequency = input.frequency.parse::<Frequency>();
    if frequency.is_err() {
        let allowed: Vec<&str> = Frequency::ALL.iter().map(Frequency::as_str).collect();
        errors.add(
            "frequency",
            format!("frequency must be one of: {}", allowed.join(", ")),
        );
    }
    if !(0..=23).contains(&input.hour) {
        errors.add("hour", "hour must be between 0 and 23");
    }
    if !(0..=59).contains(&input.minute) {
        errors.add("minute", "minute must be between 0 and 59");
    }
    match input.day_of_week {
        Some(d) if !(0..=6).contains(&d) => {
            errors.add("dayOfWeek", "dayOfWeek must be between 0 (Sunday) and 6 (Saturday)");
        }
        None if frequency.as_ref().is_ok_and(Frequency::uses_day_of_week) => {
            errors.add("dayOfWeek", "dayOfWeek is required for weekly schedules");
        }
        _ => {}
    }
    match input.day_of_month {
        Some(d) if !(1..=31).contains(&d) => {
            errors.add("dayOfMonth", "dayOfMonth must be between 1 and 31");
        }
        None if frequency == Ok(Frequency::Monthly) => {
            errors.add("dayOfMonth", "dayOfMonth is required for monthly schedules");
        }
        _ => {}
    }
    if !RETENTION_OPTIONS
        .iter()
        .any(|r| i64::from(*r) == input.retention_count)
    {
        errors.add(
            "retentionCount",
            format!("retentionCount must be one of {RETENTION_OPTIONS:?}"),
        );
    }

    ScheduleValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// Validate `input` and apply it on top of `current`, keeping the schedule's
/// identity and backup history. `next_backup_time` is left for the caller to
/// recompute.
pub fn build_schedule(input: &ScheduleInput, current: &Schedule) -> Result<Schedule> {
    let validation = validate_schedule(input);
    if !validation.is_valid {
        return Err(MarkSafeError::Validation(validation.errors));
    }
    let frequency = input
        .frequency
        .parse::<Frequency>()
        .map_err(MarkSafeError::Other)?;

    // Ranges were checked above, so the narrowing casts are lossless.
    Ok(Schedule {
        id: current.id.clone(),
        enabled: input.enabled,
        frequency,
        hour: input.hour as u8,
        minute: input.minute as u8,
        day_of_week: input.day_of_week.map(|d| d as u8),
        day_of_month: input.day_of_month.map(|d| d as u8),
        retention_count: input.retention_count as i32,
        last_backup_time: current.last_backup_time,
        next_backup_time: current.next_backup_time,
    })
}
