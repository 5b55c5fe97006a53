//! Resource monitor — samples power, connectivity and load, and classifies
//! the device as optimal, constrained or critical.
//!
//! Classification, most severe first (first match wins):
//!
//! | Condition | State |
//! |-----------|-------|
//! | network unreachable | critical |
//! | discharging below `critical_battery` | critical |
//! | discharging below `low_battery` | constrained |
//! | memory or CPU at/above pressure ratio | constrained |
//! | otherwise | optimal |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marksafe_core::config::ResourceConfig;
use marksafe_core::traits::{Clock, DeviceProbe};
use marksafe_core::types::{
    BatteryInfo, NetworkInfo, PerformanceInfo, SystemDetails, SystemState, SystemStateSnapshot,
};
use serde::Serialize;

/// What an operation needs from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationRequirements {
    /// Only run when the device is optimal.
    pub require_optimal: bool,
    /// `Some(false)` refuses constrained devices; unset means allowed.
    pub allow_constrained: Option<bool>,
}

impl OperationRequirements {
    pub fn optimal_only() -> Self {
        Self {
            require_optimal: true,
            allow_constrained: Some(false),
        }
    }
}

/// Gate decision plus the snapshot it was based on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCheck {
    pub is_safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub system_state: SystemStateSnapshot,
}

/// Samples a [`DeviceProbe`] and classifies the result.
pub struct ResourceMonitor {
    probe: Arc<dyn DeviceProbe>,
    thresholds: ResourceConfig,
    clock: Arc<dyn Clock>,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn DeviceProbe>, thresholds: ResourceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            probe,
            thresholds,
            clock,
        }
    }

    /// Take a fresh reading and classify it.
    pub async fn get_system_state(&self) -> SystemStateSnapshot {
        let (battery, network, performance) = tokio::join!(
            self.probe.battery(),
            self.probe.network(),
            self.probe.performance()
        );
        let details = SystemDetails {
            battery,
            network,
            performance,
        };
        let (state, reason) = classify(&details, &self.thresholds);
        tracing::debug!("🔋 System state: {state} ({reason})");
        SystemStateSnapshot {
            timestamp: self.clock.now(),
            state,
            reason,
            details,
        }
    }

    /// Take a fresh reading and decide whether work may run now.
    pub async fn can_perform_operation(&self, requirements: OperationRequirements) -> OperationCheck {
        let snapshot = self.get_system_state().await;
        evaluate(snapshot, requirements)
    }
}

/// Classify raw readings. Pure: the same details always give the same state.
pub fn classify(details: &SystemDetails, thresholds: &ResourceConfig) -> (SystemState, String) {
    let battery = &details.battery;
    let percent = |level: Option<f64>| level.map(|l| (l * 100.0).round() as i64).unwrap_or(0);

    if !details.network.online {
        return (SystemState::Critical, "Network is offline".to_string());
    }
    if battery.discharging_below(thresholds.critical_battery) {
        return (
            SystemState::Critical,
            format!(
                "Battery critically low ({}%, discharging)",
                percent(battery.level)
            ),
        );
    }
    if battery.discharging_below(thresholds.low_battery) {
        return (
            SystemState::Constrained,
            format!("Battery low ({}%, discharging)", percent(battery.level)),
        );
    }
    let perf = &details.performance;
    if let Some(mem) = perf.memory_used_ratio.filter(|m| *m >= thresholds.memory_pressure) {
        return (
            SystemState::Constrained,
            format!("High memory usage ({}%)", percent(Some(mem))),
        );
    }
    if let Some(cpu) = perf.cpu_load_ratio.filter(|c| *c >= thresholds.cpu_pressure) {
        return (
            SystemState::Constrained,
            format!("High CPU load ({}%)", percent(Some(cpu))),
        );
    }
    (SystemState::Optimal, "System resources are optimal".to_string())
}

/// Apply `requirements` to a snapshot.
pub fn evaluate(snapshot: SystemStateSnapshot, requirements: OperationRequirements) -> OperationCheck {
    let (is_safe, reason) = match snapshot.state {
        SystemState::Critical => (false, Some(format!("System is critical: {}", snapshot.reason))),
        SystemState::Constrained
            if requirements.require_optimal || requirements.allow_constrained == Some(false) =>
        {
            (false, Some(format!("System is constrained: {}", snapshot.reason)))
        }
        SystemState::Constrained | SystemState::Optimal => (true, None),
    };
    OperationCheck {
        is_safe,
        reason,
        system_state: snapshot,
    }
}

// ─── Host probe ──────────────────────────────────────────

/// Reads the host through sysfs/procfs, with an optional TCP reachability
/// probe. Readings that are unavailable on the platform come back unknown.
pub struct SystemProbe {
    connectivity_probe: Option<String>,
    probe_timeout: Duration,
}

impl SystemProbe {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            connectivity_probe: config.connectivity_probe.clone(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

#[async_trait]
impl DeviceProbe for SystemProbe {
    async fn battery(&self) -> BatteryInfo {
        let Ok(mut entries) = tokio::fs::read_dir("/sys/class/power_supply").await else {
            return BatteryInfo::unsupported();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).await.as_deref() != Some("Battery") {
                continue;
            }
            let level = read_trimmed(&dir.join("capacity"))
                .await
                .and_then(|s| s.parse::<f64>().ok())
                .map(|pct| (pct / 100.0).clamp(0.0, 1.0));
            let status = read_trimmed(&dir.join("status")).await.unwrap_or_default();
            return BatteryInfo {
                supported: level.is_some(),
                level,
                charging: parse_charging(&status),
            };
        }
        BatteryInfo::unsupported()
    }

    async fn network(&self) -> NetworkInfo {
        if let Some(target) = &self.connectivity_probe {
            let attempt = tokio::time::timeout(
                self.probe_timeout,
                tokio::net::TcpStream::connect(target.as_str()),
            )
            .await;
            let online = matches!(attempt, Ok(Ok(_)));
            if !online {
                tracing::debug!("🌐 Connectivity probe to {target} failed");
            }
            return NetworkInfo {
                online,
                via: Some(target.clone()),
            };
        }

        let Ok(mut entries) = tokio::fs::read_dir("/sys/class/net").await else {
            // No interface list on this platform: assume reachable.
            return NetworkInfo::default();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                continue;
            }
            if read_trimmed(&entry.path().join("operstate")).await.as_deref() == Some("up") {
                return NetworkInfo {
                    online: true,
                    via: Some(name),
                };
            }
        }
        NetworkInfo {
            online: false,
            via: None,
        }
    }

    async fn performance(&self) -> PerformanceInfo {
        let memory_used_ratio = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_meminfo_used_ratio(&s));
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpu_load_ratio = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|s| parse_loadavg_ratio(&s, cores));
        PerformanceInfo {
            memory_used_ratio,
            cpu_load_ratio,
        }
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

/// Anything but an explicit "Discharging" is treated as on external power.
fn parse_charging(status: &str) -> bool {
    !status.eq_ignore_ascii_case("discharging")
}

/// `1 - MemAvailable / MemTotal` from `/proc/meminfo` text.
fn parse_meminfo_used_ratio(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

/// One-minute load average per core from `/proc/loadavg` text.
fn parse_loadavg_ratio(loadavg: &str, cores: usize) -> Option<f64> {
    let one_min = loadavg.split_whitespace().next()?.parse::<f64>().ok()?;
    Some(one_min / cores.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FixedProbe;
    use marksafe_core::traits::SystemClock;

    fn monitor(probe: FixedProbe) -> ResourceMonitor {
        ResourceMonitor::new(Arc::new(probe), ResourceConfig::default(), Arc::new(SystemClock))
    }

    fn battery(level: f64, charging: bool) -> BatteryInfo {
        BatteryInfo {
            supported: true,
            level: Some(level),
            charging,
        }
    }

    #[tokio::test]
    async fn test_offline_is_critical_even_when_charging() {
        let probe = FixedProbe::optimal()
            .with_battery(battery(0.9, true))
            .offline();
        let snapshot = monitor(probe).get_system_state().await;
        assert_eq!(snapshot.state, SystemState::Critical);
        assert_eq!(snapshot.reason, "Network is offline");
    }

    #[tokio::test]
    async fn test_battery_thresholds() {
        let critical = monitor(FixedProbe::optimal().with_battery(battery(0.10, false)))
            .get_system_state()
            .await;
        assert_eq!(critical.state, SystemState::Critical);
        assert!(critical.reason.contains("10%"));

        let low = monitor(FixedProbe::optimal().with_battery(battery(0.25, false)))
            .get_system_state()
            .await;
        assert_eq!(low.state, SystemState::Constrained);

        let charging = monitor(FixedProbe::optimal().with_battery(battery(0.05, true)))
            .get_system_state()
            .await;
        assert_eq!(charging.state, SystemState::Optimal);
    }

    #[tokio::test]
    async fn test_pressure_is_constrained() {
        let probe = FixedProbe::optimal().with_performance(PerformanceInfo {
            memory_used_ratio: Some(0.95),
            cpu_load_ratio: Some(0.1),
        });
        let snapshot = monitor(probe).get_system_state().await;
        assert_eq!(snapshot.state, SystemState::Constrained);
        assert!(snapshot.reason.contains("memory"));

        let probe = FixedProbe::optimal().with_performance(PerformanceInfo {
            memory_used_ratio: None,
            cpu_load_ratio: Some(1.5),
        });
        let snapshot = monitor(probe).get_system_state().await;
        assert_eq!(snapshot.state, SystemState::Constrained);
        assert!(snapshot.reason.contains("CPU"));
    }

    #[tokio::test]
    async fn test_can_perform_operation_policy() {
        let constrained = FixedProbe::optimal().with_battery(battery(0.2, false));
        let m = monitor(constrained);

        let default = m.can_perform_operation(OperationRequirements::default()).await;
        assert!(default.is_safe);
        assert!(default.reason.is_none());

        let strict = m
            .can_perform_operation(OperationRequirements {
                require_optimal: true,
                allow_constrained: None,
            })
            .await;
        assert!(!strict.is_safe);
        assert!(strict.reason.unwrap().starts_with("System is constrained"));

        let disallowed = m
            .can_perform_operation(OperationRequirements {
                require_optimal: false,
                allow_constrained: Some(false),
            })
            .await;
        assert!(!disallowed.is_safe);

        let critical = monitor(FixedProbe::optimal().offline())
            .can_perform_operation(OperationRequirements::default())
            .await;
        assert!(!critical.is_safe);
        assert_eq!(critical.system_state.state, SystemState::Critical);

        let optimal = monitor(FixedProbe::optimal())
            .can_perform_operation(OperationRequirements::optimal_only())
            .await;
        assert!(optimal.is_safe);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:  1000 kB\nMemAvailable:    4000000 kB\n";
        let ratio = parse_meminfo_used_ratio(text).unwrap();
        assert!((ratio - 0.75).abs() < 1e-9);
        assert!(parse_meminfo_used_ratio("MemFree: 10 kB").is_none());
    }

    #[test]
    fn test_parse_loadavg() {
        let ratio = parse_loadavg_ratio("2.00 1.50 1.00 3/512 12345", 4).unwrap();
        assert!((ratio - 0.5).abs() < 1e-9);
        assert!(parse_loadavg_ratio("", 4).is_none());
    }

    #[test]
    fn test_parse_charging() {
        assert!(!parse_charging("Discharging"));
        assert!(parse_charging("Charging"));
        assert!(parse_charging("Full"));
        assert!(parse_charging("Not charging"));
    }

    #[tokio::test]
    async fn test_system_probe_does_not_panic() {
        let probe = SystemProbe::new(&ResourceConfig::default());
        let perf = probe.performance().await;
        if let Some(mem) = perf.memory_used_ratio {
            assert!((0.0..=1.0).contains(&mem));
        }
        let _ = probe.battery().await;
    }
}
