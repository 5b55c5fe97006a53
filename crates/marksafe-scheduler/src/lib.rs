//! # MarkSafe Scheduler
//!
//! Unattended, resource-aware periodic backups with bounded retries and a
//! missed-work queue.
//!
//! ## Design Principles
//! - Every check is a short pass over persisted state; no resident state
//! - Work is gated on battery, connectivity and load, and deferred rather than dropped
//! - Failed dispatches back off exponentially up to a fixed number of attempts
//! - Dispatches that never report back are failed after a few retry ticks
//!
//! ## Architecture
//! ```text
//! Timers (tokio interval)
//!   ├── scheduled-check (15 min) → due? → ResourceMonitor
//!   │                                  ├── fit   → Ledger record → ExecutionEngine
//!   │                                  └── unfit → MissedQueue (+ advance schedule)
//!   ├── retry-check (5 min)     → Ledger: stale in_progress → retry path
//!   │                                     due retry_pending → gate → re-dispatch
//!   └── missed-check (30 min)   → MissedQueue: oldest entry → gate → dispatch
//!
//! Engine reply ──ok──▶ success + last/next backup time + retention
//!              └─err─▶ retry_pending (backoff) or failed
//!
//! StateStore: memory | JSON files | SQLite
//! ```

pub mod adaptive;
pub mod alarm;
pub mod dispatch;
pub mod ledger;
pub mod missed;
pub mod persistence;
pub mod resource;
pub mod store;
pub mod time_calc;

#[cfg(test)]
pub(crate) mod test_support;

pub use adaptive::{AdaptiveScheduler, DeferDecision, MissedOutcome};
pub use alarm::{Alarm, AlarmManager, AlarmPeriods, RetryCheck, ScheduledCheck, StatusReport, spawn_alarms};
pub use dispatch::HttpEngine;
pub use ledger::{BackupLedger, LedgerSummary, RetryDecision, calculate_next_retry_time};
pub use missed::MissedQueue;
pub use persistence::SqliteStore;
pub use resource::{OperationCheck, OperationRequirements, ResourceMonitor, SystemProbe};
pub use store::{JsonFileStore, MemoryStore, StateRepo};
pub use time_calc::{ScheduleValidation, build_schedule, calculate_next_backup_time, validate_schedule};
