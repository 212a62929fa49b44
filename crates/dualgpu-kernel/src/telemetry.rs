//! Accelerator telemetry source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One accelerator reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    /// Utilization in percent (0-100)
    pub utilization: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: f32,
    pub power_w: f32,
}

impl GpuSample {
    pub fn memory_used_fraction(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f64 / self.memory_total_mb as f64
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse telemetry: {0}")]
    Parse(String),
}

/// Yields per-accelerator readings on demand.
#[async_trait]
pub trait GpuMetricsSource: Send + Sync {
    async fn sample(&self) -> Result<Vec<GpuSample>, TelemetryError>;
}
