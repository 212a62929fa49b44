//! Application configuration
//!
//! Layered as: defaults, then the optional config file, then `DUALGPU_*`
//! environment variables (`DUALGPU_POOL__CAPACITY=4`), then the legacy
//! `DUALGPUOPT_*` variables.

use std::collections::HashMap;
use std::path::Path;

use dualgpu_foundation::PoolConfig;
use dualgpu_foundation::backend::ServerLauncherConfig;
use dualgpu_kernel::config::{ConfigResult, load_layered};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "DUALGPU";

/// Older deployments configure the pool through these variables.
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("DUALGPUOPT_ENGINE_CACHE_SIZE", "pool.capacity"),
    ("DUALGPUOPT_MAX_ENGINE_FAILURES", "pool.health_failure_threshold"),
    ("DUALGPUOPT_METRICS_PORT", "metrics_port"),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    /// sqlx URL of the benchmark database
    #[serde(default = "default_benchmark_db")]
    pub benchmark_db: String,

    /// Serve `/metrics` on this port when set
    #[serde(default)]
    pub metrics_port: Option<u16>,

    #[serde(default)]
    pub launcher: ServerLauncherConfig,

    /// Models loaded at `serve` startup
    #[serde(default)]
    pub preload: Vec<PreloadModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreloadModel {
    pub model_path: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_benchmark_db() -> String {
    "sqlite:dualgpu_benchmarks.db".to_string()
}

fn default_backend() -> String {
    "auto".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            benchmark_db: default_benchmark_db(),
            metrics_port: None,
            launcher: ServerLauncherConfig::default(),
            preload: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        load_layered(path, ENV_PREFIX, LEGACY_ALIASES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dualgpu.toml");
        std::fs::write(&path, "").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.benchmark_db, "sqlite:dualgpu_benchmarks.db");
        assert!(config.preload.is_empty());
    }

    #[test]
    fn test_yaml_file_with_preload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dualgpu.yaml");
        std::fs::write(
            &path,
            r#"
pool:
  capacity: 3
  proactive_reload: true
benchmark_db: "sqlite::memory:"
preload:
  - model_path: /models/qwen-7b.gguf
    parameters:
      n_gpu_layers: "35"
  - model_path: /models/mistral-awq
    backend: vllm
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pool.capacity, 3);
        assert!(config.pool.proactive_reload);
        assert_eq!(config.pool.sweep_interval_secs, 10);
        assert_eq!(config.preload.len(), 2);
        assert_eq!(config.preload[0].backend, "auto");
        assert_eq!(config.preload[0].parameters["n_gpu_layers"], "35");
        assert_eq!(config.preload[1].backend, "vllm");
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dualgpu.ini");
        std::fs::write(&path, "").unwrap();
        assert!(AppConfig::load(Some(&path)).is_err());
    }
}
