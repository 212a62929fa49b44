//! Events published by the pool.
//!
//! Delivery is best-effort over a `tokio::sync::broadcast` channel: slow
//! subscribers lag and lose events, and publishing with no subscribers is
//! not an error.

use std::fmt;

use serde::Serialize;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// LRU pressure after an insertion
    Capacity,
    /// Explicit `evict` call
    Manual,
    /// Capacity was lowered
    Resize,
    /// Health failure threshold reached
    Unhealthy,
    Cleared,
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::Manual => "manual",
            EvictionReason::Resize => "resize",
            EvictionReason::Unhealthy => "unhealthy",
            EvictionReason::Cleared => "cleared",
            EvictionReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Pool lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Loaded {
        label: String,
        load_ms: u64,
    },
    LoadFailed {
        label: String,
        error: String,
    },
    Evicted {
        label: String,
        reason: EvictionReason,
    },
    HealthFailed {
        label: String,
        reason: String,
        consecutive_failures: u32,
    },
    Unloaded {
        label: String,
        reason: String,
    },
    ReloadScheduled {
        label: String,
    },
    Alert {
        level: AlertLevel,
        message: String,
    },
}
