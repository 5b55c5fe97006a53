//! Alarm manager — the orchestrator behind the three periodic timers.
//!
//! Each firing runs one check to completion against the persisted state:
//! - `scheduled-check`: dispatch the schedule when due, or defer it.
//! - `retry-check`: re-dispatch `retry_pending` records whose time has come
//!   and fail dispatches that never reported back.
//! - `missed-check`: replay one deferred firing.
//!
//! Dispatches run in the background; their completion updates the ledger.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use marksafe_core::MarkSafeConfig;
use marksafe_core::config::AlarmConfig;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::{Clock, DeviceProbe, ExecutionEngine, StateStore};
use marksafe_core::types::{
    BackupKind, BackupRecord, DEFAULT_SCHEDULE_ID, DispatchRequest, MissedBackupEntry,
    MissedBackupStats, Schedule, ScheduleInput, SystemStateSnapshot,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::adaptive::{AdaptiveScheduler, MissedOutcome};
use crate::ledger::{BackupLedger, LedgerSummary};
use crate::missed::MissedQueue;
use crate::resource::{OperationRequirements, ResourceMonitor};
use crate::store::StateRepo;
use crate::time_calc::{build_schedule, calculate_next_backup_time};

// ─── Alarms ──────────────────────────────────────────────

/// The three host timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
    ScheduledCheck,
    RetryCheck,
    MissedCheck,
}

impl Alarm {
    pub const ALL: [Alarm; 3] = [Alarm::ScheduledCheck, Alarm::RetryCheck, Alarm::MissedCheck];

    pub fn name(&self) -> &'static str {
        match self {
            Alarm::ScheduledCheck => "scheduled-check",
            Alarm::RetryCheck => "retry-check",
            Alarm::MissedCheck => "missed-check",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Alarm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            format!("unknown alarm '{s}' (expected scheduled-check, retry-check or missed-check)")
        })
    }
}

/// Timer periods, one per alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmPeriods {
    pub scheduled: Duration,
    pub retry: Duration,
    pub missed: Duration,
}

impl AlarmPeriods {
    pub fn period(&self, alarm: Alarm) -> Duration {
        match alarm {
            Alarm::ScheduledCheck => self.scheduled,
            Alarm::RetryCheck => self.retry,
            Alarm::MissedCheck => self.missed,
        }
    }
}

impl From<&AlarmConfig> for AlarmPeriods {
    fn from(config: &AlarmConfig) -> Self {
        Self {
            scheduled: Duration::from_secs(config.scheduled_check_mins * 60),
            retry: Duration::from_secs(config.retry_check_mins * 60),
            missed: Duration::from_secs(config.missed_check_mins * 60),
        }
    }
}

// ─── Check results ───────────────────────────────────────

/// What a scheduled-check firing did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduledCheck {
    Disabled,
    NotDue {
        next_backup_time: Option<DateTime<Utc>>,
    },
    Deferred {
        reason: Option<String>,
        /// `None` when a full missed-work queue dropped this firing.
        #[serde(skip_serializing_if = "Option::is_none")]
        missed_backup_id: Option<String>,
    },
    Dispatched {
        backup_id: String,
    },
}

/// What a retry-check firing did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCheck {
    /// Records re-dispatched this tick.
    pub dispatched: Vec<String>,
    /// Due records left pending because the device was not fit, with reason.
    pub skipped: Vec<(String, String)>,
    /// `in_progress` records that never reported back and were failed.
    pub recovered: Vec<String>,
}

/// Everything the `status` command shows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub schedule: Schedule,
    pub ledger: LedgerSummary,
    pub missed: MissedBackupStats,
    pub system: SystemStateSnapshot,
    pub in_flight: usize,
}

// ─── Dispatch ────────────────────────────────────────────

/// Sends one request to the engine and books the outcome. Cloned into each
/// background dispatch.
#[derive(Clone)]
struct Dispatcher {
    repo: StateRepo,
    ledger: Arc<BackupLedger>,
    engine: Arc<dyn ExecutionEngine>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Dispatcher {
    async fn run(&self, record: BackupRecord, request: DispatchRequest) {
        tracing::info!(
            "🚀 Dispatching {} (attempt {}/{}) to {} engine",
            record.id,
            record.attempt,
            record.max_attempts,
            self.engine.name()
        );
        let outcome = tokio::time::timeout(self.timeout, self.engine.execute(request)).await;
        let failure = match outcome {
            Ok(Ok(reply)) if reply.is_success() => {
                self.on_success(&record, reply.bookmark_count).await;
                return;
            }
            Ok(Ok(reply)) => reply.failure_reason(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => MarkSafeError::Timeout(format!(
                "dispatch timed out after {}s",
                self.timeout.as_secs()
            ))
            .to_string(),
        };

        tracing::warn!("⚠️ Backup {} attempt {} failed: {failure}", record.id, record.attempt);
        if let Err(e) = self.ledger.record_failure(&record.id, &failure).await {
            tracing::error!("❌ Could not book failure of {}: {e}", record.id);
        }
    }

    async fn on_success(&self, record: &BackupRecord, bookmark_count: Option<u64>) {
        if let Err(e) = self.ledger.complete(&record.id, bookmark_count).await {
            tracing::error!("❌ Could not book success of {}: {e}", record.id);
            return;
        }
        if record.kind != BackupKind::Scheduled {
            return;
        }
        let Some(schedule_id) = record.schedule_id.as_deref() else {
            return;
        };

        let now = self.clock.now();
        let guard = self.repo.lock_schedule().await;
        let retention = match self.repo.load_schedule().await {
            Ok(mut schedule) if schedule.id == schedule_id => {
                schedule.last_backup_time = Some(now);
                if schedule.enabled {
                    schedule.next_backup_time = Some(calculate_next_backup_time(&schedule, now));
                }
                if let Err(e) = self.repo.save_schedule(&schedule).await {
                    tracing::warn!("⚠️ Failed to record last backup time: {e}");
                }
                schedule.retention_count
            }
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("⚠️ Failed to load schedule after backup: {e}");
                return;
            }
        };
        drop(guard);

        if let Err(e) = self.ledger.enforce_retention_policy(schedule_id, retention).await {
            tracing::warn!("⚠️ Retention for '{schedule_id}' failed: {e}");
        }
    }
}

// ─── Manager ─────────────────────────────────────────────

/// Owns the schedule, ledger and missed-work queue, and routes timer firings.
pub struct AlarmManager {
    repo: StateRepo,
    ledger: Arc<BackupLedger>,
    adaptive: AdaptiveScheduler,
    monitor: Arc<ResourceMonitor>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    in_flight: Mutex<JoinSet<()>>,
    in_flight_ids: Arc<StdMutex<HashSet<String>>>,
}

impl AlarmManager {
    pub fn new(
        config: &MarkSafeConfig,
        store: Arc<dyn StateStore>,
        engine: Arc<dyn ExecutionEngine>,
        probe: Arc<dyn DeviceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let repo = StateRepo::new(store);
        let ledger = Arc::new(BackupLedger::new(
            repo.clone(),
            clock.clone(),
            config.retry.clone(),
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            probe,
            config.resources.clone(),
            clock.clone(),
        ));
        let queue = MissedQueue::new(repo.clone(), clock.clone(), config.missed.capacity);
        let adaptive = AdaptiveScheduler::new(monitor.clone(), queue, repo.clone(), clock.clone());
        let dispatcher = Dispatcher {
            repo: repo.clone(),
            ledger: ledger.clone(),
            engine,
            clock: clock.clone(),
            timeout: config.retry.dispatch_timeout(),
        };
        Self {
            repo,
            ledger,
            adaptive,
            monitor,
            dispatcher,
            clock,
            stale_after: chrono::Duration::seconds(config.stale_after().as_secs() as i64),
            in_flight: Mutex::new(JoinSet::new()),
            in_flight_ids: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn ledger(&self) -> &BackupLedger {
        &self.ledger
    }

    pub fn adaptive(&self) -> &AdaptiveScheduler {
        &self.adaptive
    }

    /// Route a timer firing by name. Unknown names are ignored.
    pub async fn on_alarm(&self, name: &str) {
        let Some(alarm) = Alarm::from_name(name) else {
            tracing::debug!("Ignoring unknown alarm '{name}'");
            return;
        };
        if let Err(e) = self.run_alarm(alarm).await {
            tracing::warn!("⚠️ {alarm} failed: {e}");
        }
    }

    /// Run one check and describe what it did.
    pub async fn run_alarm(&self, alarm: Alarm) -> Result<serde_json::Value> {
        let report = match alarm {
            Alarm::ScheduledCheck => serde_json::to_value(self.check_scheduled_backup().await?)?,
            Alarm::RetryCheck => serde_json::to_value(self.check_retries().await)?,
            Alarm::MissedCheck => {
                let outcome = self.check_missed_backups().await?;
                serde_json::json!({
                    "processed": outcome.processed(),
                    "reason": outcome.reason(),
                    "missedBackup": match &outcome {
                        MissedOutcome::Processed(entry) => serde_json::to_value(entry)?,
                        _ => serde_json::Value::Null,
                    },
                })
            }
        };
        Ok(report)
    }

    /// `scheduled-check`: dispatch or defer the schedule if it is due.
    pub async fn check_scheduled_backup(&self) -> Result<ScheduledCheck> {
        let now = self.clock.now();
        let guard = self.repo.lock_schedule().await;
        let mut schedule = match self.repo.load_schedule().await {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!("⚠️ Failed to load schedule, treating as not due: {e}");
                return Ok(ScheduledCheck::NotDue {
                    next_backup_time: None,
                });
            }
        };

        if !schedule.enabled {
            tracing::debug!("Schedule '{}' disabled", schedule.id);
            return Ok(ScheduledCheck::Disabled);
        }
        if schedule.next_backup_time.is_none() {
            let next = calculate_next_backup_time(&schedule, now);
            schedule.next_backup_time = Some(next);
            self.repo.save_schedule(&schedule).await?;
            tracing::info!("📅 Schedule '{}' had no next run; set to {next}", schedule.id);
            return Ok(ScheduledCheck::NotDue {
                next_backup_time: Some(next),
            });
        }
        if !schedule.is_due(now) {
            tracing::debug!(
                "Schedule '{}' not due until {:?}",
                schedule.id,
                schedule.next_backup_time
            );
            return Ok(ScheduledCheck::NotDue {
                next_backup_time: schedule.next_backup_time,
            });
        }

        let decision = self.adaptive.should_defer_backup().await;
        if decision.should_defer {
            tracing::warn!(
                "⚠️ Deferring backup for '{}': {}",
                schedule.id,
                decision.reason.as_deref().unwrap_or("resources constrained")
            );
            drop(guard);
            let entry = self.adaptive.defer_backup(&schedule).await?;
            return Ok(ScheduledCheck::Deferred {
                reason: decision.reason,
                missed_backup_id: entry.map(|e| e.id),
            });
        }

        // Move the schedule on before dispatching so the next tick does not
        // start a second chain while this one is still running or retrying.
        schedule.next_backup_time = Some(calculate_next_backup_time(&schedule, now));
        self.repo.save_schedule(&schedule).await?;
        drop(guard);

        let record = self.launch_scheduled(&schedule.id).await?;
        Ok(ScheduledCheck::Dispatched {
            backup_id: record.id,
        })
    }

    /// `retry-check`: fail silent dispatches, then re-dispatch due retries
    /// that pass the resource gate.
    pub async fn check_retries(&self) -> RetryCheck {
        let mut report = RetryCheck::default();

        for record in self.ledger.stale_in_progress(self.stale_after).await {
            if self.is_in_flight(&record.id) {
                continue;
            }
            let reason = format!(
                "no reply within {} minutes",
                self.stale_after.num_minutes()
            );
            match self.ledger.record_failure(&record.id, &reason).await {
                Ok(_) => report.recovered.push(record.id),
                Err(e) => tracing::warn!("⚠️ Could not recover {}: {e}", record.id),
            }
        }

        for record in self.ledger.get_backups_due_for_retry().await {
            let check = self
                .monitor
                .can_perform_operation(OperationRequirements::default())
                .await;
            if !check.is_safe {
                let reason = check.reason.unwrap_or(check.system_state.reason);
                tracing::warn!("⚠️ Retry of {} postponed: {reason}", record.id);
                report.skipped.push((record.id, reason));
                continue;
            }

            let record = match self.ledger.mark_in_progress(&record.id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("⚠️ Could not start retry of {}: {e}", record.id);
                    continue;
                }
            };
            let request = match record.kind {
                BackupKind::Scheduled => DispatchRequest::scheduled(
                    record.schedule_id.as_deref().unwrap_or(DEFAULT_SCHEDULE_ID),
                    &record.id,
                    record.attempt,
                ),
                BackupKind::Manual => DispatchRequest::manual(&record.id, record.attempt),
            };
            report.dispatched.push(record.id.clone());
            self.spawn_dispatch(record, request).await;
        }

        if report.dispatched.is_empty() && report.skipped.is_empty() && report.recovered.is_empty() {
            tracing::debug!("No retries due");
        }
        report
    }

    /// `missed-check`: replay at most one deferred firing.
    pub async fn check_missed_backups(&self) -> Result<MissedOutcome> {
        self.adaptive
            .process_next_missed_backup(|entry: MissedBackupEntry| async move {
                self.launch_scheduled(&entry.schedule_id).await.map(|_| ())
            })
            .await
    }

    /// Start a manual backup right away. Manual backups skip the resource
    /// gate and are never removed by retention.
    pub async fn run_manual_backup(&self) -> Result<BackupRecord> {
        let record = self.ledger.create_record(BackupKind::Manual, None).await?;
        let request = DispatchRequest::manual(&record.id, record.attempt);
        self.spawn_dispatch(record.clone(), request).await;
        Ok(record)
    }

    pub async fn get_schedule(&self) -> Result<Schedule> {
        self.repo.load_schedule().await
    }

    /// Validate and store new schedule settings. Nothing changes when
    /// validation fails.
    pub async fn update_schedule(&self, input: &ScheduleInput) -> Result<Schedule> {
        let _guard = self.repo.lock_schedule().await;
        let current = self.repo.load_schedule().await?;
        let mut schedule = build_schedule(input, &current)?;
        schedule.next_backup_time = if schedule.enabled {
            Some(calculate_next_backup_time(&schedule, self.clock.now()))
        } else {
            None
        };
        self.repo.save_schedule(&schedule).await?;
        match schedule.next_backup_time {
            Some(next) => tracing::info!("📅 Schedule '{}' set: {schedule}, next run {next}", schedule.id),
            None => tracing::info!("📅 Schedule '{}' disabled", schedule.id),
        }
        Ok(schedule)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            schedule: self.repo.load_schedule().await?,
            ledger: self.ledger.ledger_summary().await?,
            missed: self.adaptive.get_missed_backup_stats().await?,
            system: self.monitor.get_system_state().await,
            in_flight: self.in_flight_count(),
        })
    }

    /// Wait for every background dispatch to finish. Returns how many there
    /// were.
    pub async fn wait_for_dispatches(&self) -> usize {
        let mut set = std::mem::take(&mut *self.in_flight.lock().await);
        let mut drained = 0;
        while let Some(joined) = set.join_next().await {
            drained += 1;
            if let Err(e) = joined {
                tracing::error!("❌ Dispatch task panicked: {e}");
            }
        }
        drained
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    async fn launch_scheduled(&self, schedule_id: &str) -> Result<BackupRecord> {
        let record = self
            .ledger
            .create_record(BackupKind::Scheduled, Some(schedule_id))
            .await?;
        let request = DispatchRequest::scheduled(schedule_id, &record.id, record.attempt);
        self.spawn_dispatch(record.clone(), request).await;
        Ok(record)
    }

    async fn spawn_dispatch(&self, record: BackupRecord, request: DispatchRequest) {
        let id = record.id.clone();
        if let Ok(mut ids) = self.in_flight_ids.lock() {
            ids.insert(id.clone());
        }
        let ids = self.in_flight_ids.clone();
        let dispatcher = self.dispatcher.clone();

        let mut set = self.in_flight.lock().await;
        set.spawn(async move {
            dispatcher.run(record, request).await;
            if let Ok(mut ids) = ids.lock() {
                ids.remove(&id);
            }
        });
        // Reap whatever already finished.
        while let Some(joined) = set.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("❌ Dispatch task panicked: {e}");
            }
        }
    }

    fn is_in_flight(&self, backup_id: &str) -> bool {
        self.in_flight_ids
            .lock()
            .map(|ids| ids.contains(backup_id))
            .unwrap_or(false)
    }
}

/// Register the three timers. Each runs its check on every tick, the first
/// one immediately.
pub fn spawn_alarms(manager: Arc<AlarmManager>, periods: AlarmPeriods) -> Vec<JoinHandle<()>> {
    Alarm::ALL
        .into_iter()
        .map(|alarm| {
            let manager = manager.clone();
            let period = periods.period(alarm);
            tracing::info!("⏰ Alarm '{alarm}' registered (every {}s)", period.as_secs());
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    manager.on_alarm(alarm.name()).await;
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FixedProbe, Scripted, ScriptedEngine, SlowStore};
    use chrono::TimeZone;
    use marksafe_core::traits::ManualClock;
    use marksafe_core::types::{BackupStatus, DispatchAction, Frequency};

    struct Harness {
        manager: AlarmManager,
        clock: Arc<ManualClock>,
        engine: Arc<ScriptedEngine>,
        probe: Arc<FixedProbe>,
        repo: StateRepo,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 17, 12, 0, 0).unwrap()
    }

    fn harness_with(script: Vec<Scripted>, config: MarkSafeConfig) -> Harness {
        harness_on(Arc::new(MemoryStore::new()), script, config)
    }

    fn slow_harness(script: Vec<Scripted>) -> Harness {
        let store = SlowStore::new(Duration::from_millis(20));
        harness_on(Arc::new(store), script, MarkSafeConfig::default())
    }

    fn harness_on(
        store: Arc<dyn StateStore>,
        script: Vec<Scripted>,
        config: MarkSafeConfig,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = Arc::new(ScriptedEngine::new(script));
        let probe = Arc::new(FixedProbe::optimal());
        let manager = AlarmManager::new(
            &config,
            store.clone(),
            engine.clone(),
            probe.clone(),
            clock.clone(),
        );
        Harness {
            manager,
            clock,
            engine,
            probe,
            repo: StateRepo::new(store),
        }
    }

    fn harness(script: Vec<Scripted>) -> Harness {
        harness_with(script, MarkSafeConfig::default())
    }

    fn hourly_input() -> ScheduleInput {
        ScheduleInput {
            enabled: true,
            frequency: "hourly".into(),
            hour: 0,
            minute: 30,
            day_of_week: None,
            day_of_month: None,
            retention_count: 5,
        }
    }

    async fn due_schedule(h: &Harness) -> Schedule {
        let schedule = h.manager.update_schedule(&hourly_input()).await.unwrap();
        let next = schedule.next_backup_time.unwrap();
        h.clock.set(next);
        schedule
    }

    #[test]
    fn test_alarm_names_round_trip() {
        for alarm in Alarm::ALL {
            assert_eq!(alarm.name().parse::<Alarm>().unwrap(), alarm);
        }
        assert!(Alarm::from_name("cleanup").is_none());
        let periods = AlarmPeriods::from(&AlarmConfig::default());
        assert_eq!(periods.period(Alarm::ScheduledCheck), Duration::from_secs(900));
        assert_eq!(periods.period(Alarm::RetryCheck), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_unknown_alarm_is_ignored() {
        let h = harness(vec![]);
        h.manager.on_alarm("defrag").await;
        assert!(h.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_noop() {
        let h = harness(vec![]);
        let outcome = h.manager.check_scheduled_backup().await.unwrap();
        assert_eq!(outcome, ScheduledCheck::Disabled);
        assert!(h.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_not_due_is_noop() {
        let h = harness(vec![]);
        let schedule = h.manager.update_schedule(&hourly_input()).await.unwrap();
        let outcome = h.manager.check_scheduled_backup().await.unwrap();
        assert_eq!(
            outcome,
            ScheduledCheck::NotDue {
                next_backup_time: schedule.next_backup_time
            }
        );
        assert!(h.manager.ledger().get_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_schedule_dispatches_and_completes() {
        let h = harness(vec![Scripted::Ok(Some(812))]);
        let schedule = due_schedule(&h).await;
        let fired_at = h.clock.now();

        let outcome = h.manager.check_scheduled_backup().await.unwrap();
        let ScheduledCheck::Dispatched { backup_id } = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(h.manager.wait_for_dispatches().await, 1);

        let requests = h.engine.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].action, DispatchAction::ScheduledBackup);
        assert_eq!(requests[0].schedule_id.as_deref(), Some(schedule.id.as_str()));
        assert_eq!(requests[0].attempt, Some(1));

        let record = h.manager.ledger().get_backup(&backup_id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Success);
        assert_eq!(record.bookmark_count, Some(812));

        let stored = h.repo.load_schedule().await.unwrap();
        assert_eq!(stored.last_backup_time, Some(fired_at));
        assert!(stored.next_backup_time.unwrap() > fired_at);

        // Same instant again: not due any more.
        let again = h.manager.check_scheduled_backup().await.unwrap();
        assert!(matches!(again, ScheduledCheck::NotDue { .. }));
    }

    #[tokio::test]
    async fn test_failure_enters_retry_then_succeeds() {
        let h = harness(vec![Scripted::Error("upload failed: 503".into()), Scripted::Ok(None)]);
        due_schedule(&h).await;

        let ScheduledCheck::Dispatched { backup_id } = h.manager.check_scheduled_backup().await.unwrap() else {
            panic!("expected dispatch");
        };
        h.manager.wait_for_dispatches().await;

        let record = h.manager.ledger().get_backup(&backup_id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::RetryPending);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.last_error.as_deref(), Some("upload failed: 503"));

        // Not yet due.
        let report = h.manager.check_retries().await;
        assert!(report.dispatched.is_empty());

        h.clock.advance(chrono::Duration::minutes(5));
        let report = h.manager.check_retries().await;
        assert_eq!(report.dispatched, vec![backup_id.clone()]);
        h.manager.wait_for_dispatches().await;

        let requests = h.engine.requests();
        assert_eq!(requests[1].attempt, Some(2));
        let record = h.manager.ledger().get_backup(&backup_id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Success);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let h = harness(vec![
            Scripted::Transport("connection refused".into()),
            Scripted::Error("a".into()),
            Scripted::Error("b".into()),
        ]);
        let record = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;

        for minutes in [5, 10] {
            h.clock.advance(chrono::Duration::minutes(minutes));
            let report = h.manager.check_retries().await;
            assert_eq!(report.dispatched.len(), 1);
            h.manager.wait_for_dispatches().await;
        }

        let record = h.manager.ledger().get_backup(&record.id).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.attempt, record.max_attempts);
        assert_eq!(h.engine.requests().len(), 3);
        assert!(h.engine.requests().iter().all(|r| r.action == DispatchAction::ManualBackup));
    }

    #[tokio::test]
    async fn test_retry_skipped_when_offline() {
        let h = harness(vec![Scripted::Error("x".into())]);
        let record = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;

        h.probe.set_online(false);
        h.clock.advance(chrono::Duration::minutes(5));
        let report = h.manager.check_retries().await;
        assert!(report.dispatched.is_empty());
        assert_eq!(report.skipped.len(), 1);
        let stored = h.manager.ledger().get_backup(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::RetryPending);

        h.probe.set_online(true);
        let report = h.manager.check_retries().await;
        assert_eq!(report.dispatched, vec![record.id]);
        h.manager.wait_for_dispatches().await;
    }

    #[tokio::test]
    async fn test_constrained_device_defers_then_replays() {
        let h = harness(vec![]);
        let schedule = due_schedule(&h).await;
        let due_at = h.clock.now();
        h.probe.set_online(false);

        let outcome = h.manager.check_scheduled_backup().await.unwrap();
        assert!(matches!(outcome, ScheduledCheck::Deferred { .. }));
        assert!(h.engine.requests().is_empty());

        let stored = h.repo.load_schedule().await.unwrap();
        assert!(stored.next_backup_time.unwrap() > due_at);
        let queued = h.manager.adaptive().get_missed_backups().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].scheduled_time, due_at);

        // Still offline: the queue is left alone.
        let blocked = h.manager.check_missed_backups().await.unwrap();
        assert!(!blocked.processed());

        h.probe.set_online(true);
        let replayed = h.manager.check_missed_backups().await.unwrap();
        assert!(replayed.processed());
        h.manager.wait_for_dispatches().await;

        let requests = h.engine.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].schedule_id.as_deref(), Some(schedule.id.as_str()));
        assert_eq!(h.manager.adaptive().get_missed_backup_stats().await.unwrap().count, 0);

        let empty = h.manager.check_missed_backups().await.unwrap();
        assert_eq!(empty.reason().as_deref(), Some("No missed backups in queue"));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_counts_as_failure() {
        let mut config = MarkSafeConfig::default();
        config.retry.dispatch_timeout_secs = 1;
        let h = harness_with(vec![Scripted::Hang], config);
        let record = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;

        let stored = h.manager.ledger().get_backup(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::RetryPending);
        let error = stored.last_error.unwrap();
        assert!(error.starts_with("Timeout: "));
        assert!(error.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_stale_in_progress_reenters_retry() {
        let h = harness(vec![]);
        // A record left behind by a process that died mid-dispatch.
        let orphan = h
            .manager
            .ledger()
            .create_record(BackupKind::Scheduled, Some(DEFAULT_SCHEDULE_ID))
            .await
            .unwrap();

        let report = h.manager.check_retries().await;
        assert!(report.recovered.is_empty());

        h.clock.advance(chrono::Duration::minutes(16));
        let report = h.manager.check_retries().await;
        assert_eq!(report.recovered, vec![orphan.id.clone()]);
        let stored = h.manager.ledger().get_backup(&orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::RetryPending);
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn test_retention_applied_after_scheduled_success() {
        let h = harness(vec![]);
        let mut input = hourly_input();
        input.retention_count = 5;
        h.manager.update_schedule(&input).await.unwrap();

        for _ in 0..7 {
            let next = h.repo.load_schedule().await.unwrap().next_backup_time.unwrap();
            h.clock.set(next);
            let outcome = h.manager.check_scheduled_backup().await.unwrap();
            assert!(matches!(outcome, ScheduledCheck::Dispatched { .. }));
            h.manager.wait_for_dispatches().await;
        }
        let manual = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;

        let backups = h.manager.ledger().get_backups().await.unwrap();
        let scheduled = backups.iter().filter(|b| b.kind == BackupKind::Scheduled).count();
        assert_eq!(scheduled, 5);
        assert!(backups.iter().any(|b| b.id == manual.id));
    }

    #[tokio::test]
    async fn test_update_schedule_validation_leaves_state() {
        let h = harness(vec![]);
        let before = h.manager.update_schedule(&hourly_input()).await.unwrap();

        let mut bad = hourly_input();
        bad.minute = 75;
        bad.frequency = "fortnightly".into();
        let err = h.manager.update_schedule(&bad).await.unwrap_err();
        let MarkSafeError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(errors.get("minute").is_some());
        assert!(errors.get("frequency").is_some());
        assert_eq!(h.repo.load_schedule().await.unwrap(), before);

        let mut off = hourly_input();
        off.enabled = false;
        let disabled = h.manager.update_schedule(&off).await.unwrap();
        assert!(disabled.next_backup_time.is_none());
        assert_eq!(disabled.frequency, Frequency::Hourly);
    }

    #[tokio::test]
    async fn test_status_report() {
        let h = harness(vec![]);
        h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;
        let status = h.manager.status().await.unwrap();
        assert_eq!(status.ledger.total, 1);
        assert_eq!(status.ledger.success, 1);
        assert_eq!(status.missed.count, 0);
        assert_eq!(status.in_flight, 0);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["system"]["state"], "optimal");
    }

    #[tokio::test]
    async fn test_run_alarm_reports() {
        let h = harness(vec![]);
        let report = h.manager.run_alarm(Alarm::MissedCheck).await.unwrap();
        assert_eq!(report["processed"], false);
        assert_eq!(report["reason"], "No missed backups in queue");
        let report = h.manager.run_alarm(Alarm::ScheduledCheck).await.unwrap();
        assert_eq!(report["outcome"], "disabled");
    }

    #[tokio::test]
    async fn test_overlapping_manual_backups_keep_every_record() {
        let h = slow_harness(vec![]);
        let first = h.manager.run_manual_backup().await.unwrap();
        let second = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;

        for id in [&first.id, &second.id] {
            let stored = h.manager.ledger().get_backup(id).await.unwrap().unwrap();
            assert_eq!(stored.status, BackupStatus::Success);
        }
        assert_eq!(h.manager.ledger().ledger_summary().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_retry_check_alongside_completing_dispatch() {
        let h = slow_harness(vec![Scripted::Error("quota".into())]);
        let retried = h.manager.run_manual_backup().await.unwrap();
        h.manager.wait_for_dispatches().await;
        h.clock.advance(chrono::Duration::minutes(5));

        let (fresh, report) = tokio::join!(h.manager.run_manual_backup(), h.manager.check_retries());
        let fresh = fresh.unwrap();
        assert_eq!(report.dispatched, vec![retried.id.clone()]);
        h.manager.wait_for_dispatches().await;

        let retried = h.manager.ledger().get_backup(&retried.id).await.unwrap().unwrap();
        assert_eq!(retried.status, BackupStatus::Success);
        assert_eq!(retried.attempt, 2);
        let fresh = h.manager.ledger().get_backup(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, BackupStatus::Success);
        assert_eq!(h.engine.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_deferral_dropped_by_full_queue_reports_no_entry() {
        let mut config = MarkSafeConfig::default();
        config.missed.capacity = 1;
        let h = harness_with(vec![], config);
        let due = due_schedule(&h).await.next_backup_time.unwrap();
        h.manager
            .adaptive()
            .queue()
            .add_missed_backup(DEFAULT_SCHEDULE_ID, due - chrono::Duration::hours(6))
            .await
            .unwrap();
        h.probe.set_online(false);

        let outcome = h.manager.check_scheduled_backup().await.unwrap();
        let ScheduledCheck::Deferred { missed_backup_id, .. } = &outcome else {
            panic!("expected deferral, got {outcome:?}");
        };
        assert!(missed_backup_id.is_none());
        assert!(serde_json::to_value(&outcome).unwrap().get("missed_backup_id").is_none());
        let queued = h.manager.adaptive().get_missed_backups().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].scheduled_time < due);
        assert!(h.repo.load_schedule().await.unwrap().next_backup_time.unwrap() > due);
    }
}
