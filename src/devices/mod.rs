mod cache;
pub mod cpu;
pub mod nvidia;

pub use cache::DeviceStatusCache;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub usage_pct: f32,
    pub temp_c: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub online: bool,
    pub info: Option<DeviceInfo>,
    pub error: Option<String>,
}

impl DeviceStatus {
    pub fn online(info: DeviceInfo) -> Self {
        Self {
            online: true,
            info: Some(info),
            error: None,
        }
    }

    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            online: false,
            info: None,
            error: Some(error.into()),
        }
    }
}

/// A single hardware device. Probes are capability objects, not an
/// inheritance hierarchy -- a name plus "what's your status right now".
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> DeviceStatus;
}
