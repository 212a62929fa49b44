//! Health probing contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::BackendHandle;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn timeout() -> Self {
        ProbeOutcome::Unhealthy("timeout".to_string())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Health of a resident cache entry.
///
/// Entries that cross the failure threshold are removed from the pool, so
/// only the two resident states are represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No recent probe failures
    Healthy,
    /// One or more consecutive probe failures; still served
    Degraded,
}

impl HealthState {
    pub fn from_failures(consecutive_failures: u32) -> Self {
        if consecutive_failures == 0 {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Backend-specific liveness check.
///
/// Implementations must return within `timeout`; on expiry they return
/// [`ProbeOutcome::timeout`].
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, handle: &dyn BackendHandle, timeout: Duration) -> ProbeOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_from_failures() {
        assert_eq!(HealthState::from_failures(0), HealthState::Healthy);
        assert_eq!(HealthState::from_failures(1), HealthState::Degraded);
        assert_eq!(HealthState::from_failures(7), HealthState::Degraded);
    }

    #[test]
    fn test_timeout_outcome() {
        assert_eq!(
            ProbeOutcome::timeout(),
            ProbeOutcome::Unhealthy("timeout".into())
        );
        assert!(!ProbeOutcome::timeout().is_healthy());
    }
}
