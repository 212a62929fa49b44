//! Configuration for the engine pool.

use std::time::Duration;

use dualgpu_kernel::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};

/// Tunables for [`EnginePool`](super::EnginePool).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of resident engines (default: 2).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Seconds between background health sweeps (default: 10).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Consecutive probe failures before an engine is unloaded (default: 3).
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    /// Per-probe timeout in milliseconds (default: 5000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Probes run in parallel during one sweep (default: 2).
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// Upper bound handed to the launcher for one load, if any.
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,

    /// Reload recently active engines after a health-driven unload.
    #[serde(default)]
    pub proactive_reload: bool,

    /// How recently an engine must have been used to qualify for a
    /// proactive reload (default: 300).
    #[serde(default = "default_reload_window_secs")]
    pub reload_window_secs: u64,

    /// Run a short generation after each load to benchmark it (default: true).
    #[serde(default = "default_warmup_benchmark")]
    pub warmup_benchmark: bool,

    /// How long `shutdown` waits for in-flight loads to settle (default: 30).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_capacity() -> usize {
    2
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_concurrency() -> usize {
    2
}

fn default_reload_window_secs() -> u64 {
    300
}

fn default_warmup_benchmark() -> bool {
    true
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            health_failure_threshold: default_health_failure_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_concurrency: default_probe_concurrency(),
            load_timeout_secs: None,
            proactive_reload: false,
            reload_window_secs: default_reload_window_secs(),
            warmup_benchmark: default_warmup_benchmark(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn with_health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_failure_threshold = threshold;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency;
        self
    }

    pub fn with_load_timeout_secs(mut self, secs: u64) -> Self {
        self.load_timeout_secs = Some(secs);
        self
    }

    pub fn with_proactive_reload(mut self, enabled: bool) -> Self {
        self.proactive_reload = enabled;
        self
    }

    pub fn with_reload_window_secs(mut self, secs: u64) -> Self {
        self.reload_window_secs = secs;
        self
    }

    pub fn with_warmup_benchmark(mut self, enabled: bool) -> Self {
        self.warmup_benchmark = enabled;
        self
    }

    /// Reject values the pool cannot operate with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.capacity == 0 {
            return Err(PoolError::InvalidConfig("capacity must be at least 1".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(PoolError::InvalidConfig(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        if self.health_failure_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "health_failure_threshold must be at least 1".into(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig(
                "probe_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.probe_concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "probe_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_secs.map(Duration::from_secs)
    }

    pub fn reload_window(&self) -> Duration {
        Duration::from_secs(self.reload_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.health_failure_threshold, 3);
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert!(!config.proactive_reload);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_zero_capacity() {
        let config = PoolConfig::default().with_capacity(0);
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_config_rejects_zero_threshold_and_concurrency() {
        assert!(PoolConfig::default()
            .with_health_failure_threshold(0)
            .validate()
            .is_err());
        assert!(PoolConfig::default()
            .with_probe_concurrency(0)
            .validate()
            .is_err());
        assert!(PoolConfig::default()
            .with_sweep_interval_secs(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_config_partial_deserialize_uses_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"capacity": 4}"#).unwrap();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.health_failure_threshold, 3);
        assert!(config.warmup_benchmark);
        assert_eq!(config.load_timeout(), None);
    }
}
