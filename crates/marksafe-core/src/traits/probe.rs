//! Device sampling trait.

use async_trait::async_trait;

use crate::types::{BatteryInfo, NetworkInfo, PerformanceInfo};

/// Reads raw device conditions. Implementations never fail: a reading that
/// cannot be taken is reported as unknown/unsupported.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn battery(&self) -> BatteryInfo;

    async fn network(&self) -> NetworkInfo;

    async fn performance(&self) -> PerformanceInfo;
}
