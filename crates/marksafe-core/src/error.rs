//! Unified error types for MarkSafe.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Result type alias using MarkSafeError.
pub type Result<T> = std::result::Result<T, MarkSafeError>;

#[derive(Error, Debug)]
pub enum MarkSafeError {
    // Schedule errors
    #[error("Invalid schedule: {0}")]
    Validation(ValidationErrors),

    // Ledger errors
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    // Execution engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MarkSafeError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failed operation may succeed if simply tried again later.
    /// Validation and not-found errors are surfaced, never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Engine(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

/// Field-keyed schedule validation failures.
///
/// Every field is checked independently, so one report can carry several
/// messages at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: BTreeMap<&'static str, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `field`. A later message for the same field wins.
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.insert(field, message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Message recorded for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.errors.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.errors.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|(field, msg)| format!("{field}: {msg}"))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl From<ValidationErrors> for MarkSafeError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}
