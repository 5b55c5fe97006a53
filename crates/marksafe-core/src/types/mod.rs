//! Shared data model.

pub mod backup;
pub mod dispatch;
pub mod missed;
pub mod schedule;
pub mod system;

pub use backup::{BackupKind, BackupRecord, BackupStatus, DEFAULT_MAX_ATTEMPTS};
pub use dispatch::{DispatchAction, DispatchReply, DispatchRequest, ReplyStatus};
pub use missed::{MissedBackupEntry, MissedBackupStats};
pub use schedule::{
    DEFAULT_SCHEDULE_ID, Frequency, RETENTION_OPTIONS, RETENTION_UNLIMITED, Schedule,
    ScheduleInput,
};
pub use system::{
    BatteryInfo, NetworkInfo, PerformanceInfo, SystemDetails, SystemState, SystemStateSnapshot,
};
