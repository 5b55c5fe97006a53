//! MarkSafe configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MarkSafeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkSafeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub alarms: AlarmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub missed: MissedConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_data_dir() -> String { "~/.marksafe".into() }

impl Default for MarkSafeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            alarms: AlarmConfig::default(),
            retry: RetryConfig::default(),
            resources: ResourceConfig::default(),
            missed: MissedConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl MarkSafeConfig {
    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MarkSafeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MarkSafeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MarkSafeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the MarkSafe home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".marksafe")
    }

    /// `data_dir` with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    /// How long an `in_progress` record may stay silent before the retry
    /// check fails it: `stale_after_ticks` retry-check periods.
    pub fn stale_after(&self) -> Duration {
        let ticks = u64::from(self.retry.stale_after_ticks.max(1));
        Duration::from_secs(self.alarms.retry_check_mins.max(1) * 60 * ticks)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.alarms.scheduled_check_mins == 0
            || self.alarms.retry_check_mins == 0
            || self.alarms.missed_check_mins == 0
        {
            problems.push("alarm periods must be at least 1 minute".to_string());
        }
        if self.retry.base_delay_mins == 0 {
            problems.push("retry.base_delay_mins must be at least 1".to_string());
        }
        if self.retry.max_delay_mins < self.retry.base_delay_mins {
            problems.push("retry.max_delay_mins must not be below base_delay_mins".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.stale_after_ticks == 0 {
            problems.push("retry.stale_after_ticks must be at least 1".to_string());
        }
        // A dispatch still running in another process must not look stale.
        if self.retry.dispatch_timeout_secs == 0
            || self.retry.dispatch_timeout() >= self.stale_after()
        {
            problems.push(format!(
                "retry.dispatch_timeout_secs must be between 1 and {}s (stale_after_ticks x retry_check_mins)",
                self.stale_after().as_secs().saturating_sub(1)
            ));
        }
        let r = &self.resources;
        if !(0.0..=1.0).contains(&r.critical_battery) || !(0.0..=1.0).contains(&r.low_battery) {
            problems.push("battery thresholds must be within 0.0..=1.0".to_string());
        }
        if !(0.0..=1.0).contains(&r.memory_pressure) || !(0.0..=1.0).contains(&r.cpu_pressure) {
            problems.push("pressure thresholds must be within 0.0..=1.0".to_string());
        }
        if r.critical_battery > r.low_battery {
            problems.push("resources.critical_battery must not exceed low_battery".to_string());
        }
        if self.missed.capacity == 0 {
            problems.push("missed.capacity must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MarkSafeError::Config(problems.join("; ")))
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "json", "sqlite" or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// Directory (json) or database file (sqlite). Defaults under `data_dir`.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_store_backend() -> String { "json".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

/// Periods of the three host timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_scheduled_check_mins")]
    pub scheduled_check_mins: u64,
    #[serde(default = "default_retry_check_mins")]
    pub retry_check_mins: u64,
    #[serde(default = "default_missed_check_mins")]
    pub missed_check_mins: u64,
}

fn default_scheduled_check_mins() -> u64 { 15 }
fn default_retry_check_mins() -> u64 { 5 }
fn default_missed_check_mins() -> u64 { 30 }

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            scheduled_check_mins: default_scheduled_check_mins(),
            retry_check_mins: default_retry_check_mins(),
            missed_check_mins: default_missed_check_mins(),
        }
    }
}

/// Retry / backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_mins")]
    pub base_delay_mins: u32,
    #[serde(default = "default_max_delay_mins")]
    pub max_delay_mins: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Longest a single dispatch may take before it counts as failed.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Retry-check ticks after which a silent `in_progress` record is failed.
    #[serde(default = "default_stale_after_ticks")]
    pub stale_after_ticks: u32,
}

fn default_base_delay_mins() -> u32 { 5 }
fn default_max_delay_mins() -> u32 { 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_dispatch_timeout_secs() -> u64 { 600 }
fn default_stale_after_ticks() -> u32 { 3 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_mins: default_base_delay_mins(),
            max_delay_mins: default_max_delay_mins(),
            max_attempts: default_max_attempts(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            stale_after_ticks: default_stale_after_ticks(),
        }
    }
}

impl RetryConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Resource gating thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Discharging below this battery level is critical.
    #[serde(default = "default_critical_battery")]
    pub critical_battery: f64,
    /// Discharging below this battery level is constrained.
    #[serde(default = "default_low_battery")]
    pub low_battery: f64,
    /// Memory use ratio at or above which the device is constrained.
    #[serde(default = "default_pressure")]
    pub memory_pressure: f64,
    /// Per-core load ratio at or above which the device is constrained.
    #[serde(default = "default_pressure")]
    pub cpu_pressure: f64,
    /// Optional "host:port" reached over TCP to confirm connectivity.
    #[serde(default)]
    pub connectivity_probe: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_critical_battery() -> f64 { 0.15 }
fn default_low_battery() -> f64 { 0.30 }
fn default_pressure() -> f64 { 0.90 }
fn default_probe_timeout_ms() -> u64 { 1500 }

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            critical_battery: default_critical_battery(),
            low_battery: default_low_battery(),
            memory_pressure: default_pressure(),
            cpu_pressure: default_pressure(),
            connectivity_probe: None,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Missed-work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedConfig {
    #[serde(default = "default_missed_capacity")]
    pub capacity: usize,
}

fn default_missed_capacity() -> usize { 10 }

impl Default for MissedConfig {
    fn default() -> Self {
        Self { capacity: default_missed_capacity() }
    }
}

/// Execution engine endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_engine_endpoint() -> String { "http://127.0.0.1:7420/backup".into() }
fn default_engine_timeout_secs() -> u64 { 300 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_engine_endpoint(),
            timeout_secs: default_engine_timeout_secs(),
            headers: BTreeMap::new(),
        }
    }
}
