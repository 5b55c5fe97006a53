//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::{DeviceProbe, ExecutionEngine, StateStore};
use marksafe_core::types::{
    BatteryInfo, DispatchReply, DispatchRequest, NetworkInfo, PerformanceInfo, SystemDetails,
};

use crate::store::MemoryStore;

/// In-memory store whose reads take a while, so concurrent read-modify-write
/// cycles overlap.
pub struct SlowStore {
    inner: MemoryStore,
    read_delay: Duration,
}

impl SlowStore {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            read_delay,
        }
    }
}

#[async_trait]
impl StateStore for SlowStore {
    fn name(&self) -> &str {
        "slow-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}

/// Device readings that stay put until a test changes them.
pub struct FixedProbe {
    details: Mutex<SystemDetails>,
}

impl FixedProbe {
    /// Mains power, online, idle.
    pub fn optimal() -> Self {
        Self {
            details: Mutex::new(SystemDetails {
                battery: BatteryInfo::unsupported(),
                network: NetworkInfo::default(),
                performance: PerformanceInfo {
                    memory_used_ratio: Some(0.4),
                    cpu_load_ratio: Some(0.2),
                },
            }),
        }
    }

    pub fn with_battery(self, battery: BatteryInfo) -> Self {
        self.details.lock().unwrap().battery = battery;
        self
    }

    pub fn with_performance(self, performance: PerformanceInfo) -> Self {
        self.details.lock().unwrap().performance = performance;
        self
    }

    pub fn offline(self) -> Self {
        self.set_online(false);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.details.lock().unwrap().network = NetworkInfo { online, via: None };
    }
}

#[async_trait]
impl DeviceProbe for FixedProbe {
    async fn battery(&self) -> BatteryInfo {
        self.details.lock().unwrap().battery.clone()
    }

    async fn network(&self) -> NetworkInfo {
        self.details.lock().unwrap().network.clone()
    }

    async fn performance(&self) -> PerformanceInfo {
        self.details.lock().unwrap().performance.clone()
    }
}

/// How the scripted engine answers one request.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok(Option<u64>),
    Error(String),
    Transport(String),
    /// Never answers.
    Hang,
}

/// Engine that replays a script and records every request. Once the script
/// runs out every request succeeds.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedEngine {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchReply> {
        let backup_id = request.backup_id.clone();
        self.requests.lock().unwrap().push(request);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Ok(None));
        match step {
            Scripted::Ok(count) => Ok(DispatchReply::ok(backup_id, count)),
            Scripted::Error(msg) => Ok(DispatchReply::error(msg)),
            Scripted::Transport(msg) => Err(MarkSafeError::engine(msg)),
            Scripted::Hang => std::future::pending().await,
        }
    }
}
