//! # dualgpu-kernel
//!
//! Contracts shared by every part of the engine pool:
//!
//! - [`ModelKey`]: the value that identifies one loadable model configuration
//! - [`BackendHandle`] / [`BackendLauncher`]: what a loaded engine can do and
//!   how one is produced
//! - [`HealthProbe`]: backend-specific liveness checks
//! - [`MetricsSink`]: optional counters and histograms, no-op by default
//! - [`BenchmarkStore`]: append-only load/throughput history
//! - [`GpuMetricsSource`]: accelerator telemetry on demand
//!
//! Runtime machinery lives in `dualgpu-foundation`; this crate only defines
//! the seams.

pub mod backend;
pub mod benchmark;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model_key;
pub mod telemetry;

pub use backend::{BackendHandle, BackendLauncher, Generation, GenerationParams};
pub use benchmark::{BenchmarkRecord, BenchmarkStore, ModelPerformance};
pub use error::{BackendError, BackendResult, PoolError, PoolResult, StoreError, StoreResult};
pub use health::{HealthProbe, HealthState, ProbeOutcome};
pub use metrics::{MetricsSink, NoopMetricsSink, sanitize_label};
pub use model_key::{BackendKind, ModelKey, ParamValue};
pub use telemetry::{GpuMetricsSource, GpuSample, TelemetryError};
