//! # dualgpu-foundation
//!
//! Building blocks behind the DualGPU engine pool:
//!
//! - [`engine_pool`]: bounded, health-aware LRU cache of loaded engines with
//!   single-flight loads and background health sweeps
//! - [`backend`]: launchers for llama.cpp, vLLM and text-generation-inference
//!   servers, plus an in-process mock
//! - [`health_probe`]: per-backend probes and the registry the pool consults
//! - [`persistence`]: benchmark history stores (SQLite in WAL mode, in-memory)
//! - [`metrics`]: an in-memory [`MetricsSink`](dualgpu_kernel::MetricsSink)
//! - [`telemetry`]: `nvidia-smi` backed GPU readings
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dualgpu_foundation::backend::MockLauncher;
//! use dualgpu_foundation::engine_pool::{EnginePool, PoolConfig};
//! use dualgpu_kernel::{BackendKind, GenerationParams, ModelKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = EnginePool::builder(Arc::new(MockLauncher::new()))
//!         .config(PoolConfig::default().with_capacity(2))
//!         .build()?;
//!     pool.start();
//!
//!     let key = ModelKey::simple("/models/m1", BackendKind::Mock)?;
//!     let engine = pool.get(&key).await?;
//!     let out = engine.generate("Hello", &GenerationParams::default()).await?;
//!     println!("{}", out.text);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod engine_pool;
pub mod health_probe;
pub mod metrics;
pub mod persistence;
pub mod telemetry;

pub use engine_pool::{EnginePool, EnginePoolBuilder, PoolConfig, PoolStats, SweepReport};
