//! Collaborator seams: persistence, execution, device sampling, time.

pub mod clock;
pub mod engine;
pub mod probe;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::ExecutionEngine;
pub use probe::DeviceProbe;
pub use store::{KEY_BACKUPS, KEY_MISSED_BACKUPS, KEY_SCHEDULE, StateStore};
