//! # MarkSafe Core
//!
//! Shared data model, error type, configuration, and the collaborator traits
//! (store, execution engine, device probe, clock) the scheduler is built on.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::MarkSafeConfig;
pub use error::{MarkSafeError, Result, ValidationErrors};
