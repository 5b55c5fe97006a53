//! Device resource snapshots used to gate work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse health classification of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Optimal,
    Constrained,
    Critical,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemState::Optimal => write!(f, "optimal"),
            SystemState::Constrained => write!(f, "constrained"),
            SystemState::Critical => write!(f, "critical"),
        }
    }
}

/// Power source reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    /// False when the device has no battery or it cannot be read.
    pub supported: bool,
    /// Charge level in `0.0..=1.0`.
    pub level: Option<f64>,
    pub charging: bool,
}

impl BatteryInfo {
    /// Mains-powered device.
    pub fn unsupported() -> Self {
        Self::default()
    }

    pub fn discharging_below(&self, threshold: f64) -> bool {
        self.supported && !self.charging && self.level.is_some_and(|l| l < threshold)
    }
}

/// Connectivity reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub online: bool,
    /// Interface or probe that decided the reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            online: true,
            via: None,
        }
    }
}

/// Load reading. Ratios are in `0.0..=1.0`; `None` when unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceInfo {
    pub memory_used_ratio: Option<f64>,
    /// One-minute load average divided by the core count.
    pub cpu_load_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemDetails {
    pub battery: BatteryInfo,
    pub network: NetworkInfo,
    pub performance: PerformanceInfo,
}

/// One classification of device conditions. Recomputed on demand, never
/// persisted as authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub state: SystemState,
    pub reason: String,
    pub details: SystemDetails,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discharging_below() {
        let b = BatteryInfo {
            supported: true,
            level: Some(0.10),
            charging: false,
        };
        assert!(b.discharging_below(0.15));
        let charging = BatteryInfo {
            charging: true,
            ..b.clone()
        };
        assert!(!charging.discharging_below(0.15));
        assert!(!BatteryInfo::unsupported().discharging_below(0.15));
    }

    #[test]
    fn test_state_ordering() {
        assert!(SystemState::Critical > SystemState::Constrained);
        assert!(SystemState::Constrained > SystemState::Optimal);
    }
}
