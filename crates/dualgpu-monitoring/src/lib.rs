//! # dualgpu-monitoring
//!
//! Observability surface for a running [`EnginePool`](dualgpu_foundation::EnginePool):
//!
//! - [`prometheus`]: a [`MetricsSink`](dualgpu_kernel::MetricsSink) backed by
//!   a Prometheus registry
//! - [`server`]: a small axum service exposing `/metrics`, pool status and
//!   maintenance endpoints

pub mod prometheus;
pub mod server;

pub use self::prometheus::{PrometheusMetricsSink, PrometheusSinkError};
pub use server::{AppState, MetricsServer, MetricsServerConfig};
