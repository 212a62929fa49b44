//! Error taxonomy for the engine pool and its collaborators.

use std::time::Duration;

/// Errors returned to callers of the engine pool.
///
/// `Clone` so that every waiter on a shared in-flight load receives the same
/// outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The request was malformed; rejected before touching shared state.
    #[error("invalid model key: {0}")]
    InvalidKey(String),

    /// Backend construction or initialization failed.
    #[error("failed to load model: {0}")]
    LoadFailed(String),

    /// The caller's deadline elapsed while a load was in flight.
    #[error("timed out after {0:?} waiting for model load")]
    Timeout(Duration),

    /// The pool is being torn down and accepts no new work.
    #[error("engine pool is shutting down")]
    PoolShuttingDown,

    /// A health probe failed; only ever surfaced through metrics and events.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// A configuration value was rejected.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors produced by a backend or its launcher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("failed to launch backend: {0}")]
    Launch(String),

    #[error("backend not ready: {0}")]
    NotReady(String),

    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend unhealthy: {0}")]
    Unhealthy(String),

    #[error("unsupported backend: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

impl From<BackendError> for PoolError {
    fn from(err: BackendError) -> Self {
        PoolError::LoadFailed(err.to_string())
    }
}

/// Errors produced by benchmark persistence.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for benchmark persistence
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failed_message_is_actionable() {
        let err = PoolError::LoadFailed("model file missing".into());
        assert_eq!(err.to_string(), "failed to load model: model file missing");
    }

    #[test]
    fn backend_error_converts_to_load_failed() {
        let err: PoolError = BackendError::Launch("llama-server not found".into()).into();
        assert!(matches!(err, PoolError::LoadFailed(ref msg) if msg.contains("llama-server")));
    }
}
