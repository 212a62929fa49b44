//! Axum-based status server for an engine pool.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/metrics` | Prometheus text exposition of the pool sink. |
//! | `GET`  | `/health` | `200` while serving, `503` once the pool is shutting down. |
//! | `GET`  | `/pool` | Pool statistics and resident engines, MRU first. |
//! | `POST` | `/pool/sweep` | Run one health sweep now and return its report. |
//! | `POST` | `/pool/evict` | Evict one engine by key. |
//! | `POST` | `/pool/capacity` | Resize the cache. |

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dualgpu_foundation::EnginePool;
use dualgpu_kernel::ModelKey;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::prometheus::PrometheusMetricsSink;

// ─────────────────────────────────────────────────────────────────────────────
// Shared application state
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state injected into every handler via the [`State`] extractor.
#[derive(Clone)]
pub struct AppState {
    pool: EnginePool,
    sink: Option<Arc<PrometheusMetricsSink>>,
}

impl AppState {
    /// `sink` should be the same sink the pool was built with; without one
    /// `/metrics` answers `404`.
    pub fn new(pool: EnginePool, sink: Option<Arc<PrometheusMetricsSink>>) -> Self {
        Self { pool, sink }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MetricsServerConfig
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub host: String,
    /// TCP port to listen on (default: 9090).
    pub port: u16,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl MetricsServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MetricsServer
// ─────────────────────────────────────────────────────────────────────────────

pub struct MetricsServer {
    config: MetricsServerConfig,
    state: AppState,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the axum [`Router`]. Call [`serve()`](Self::serve) to bind.
    pub fn build_app(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/pool", get(pool_handler))
            .route("/pool/sweep", post(sweep_handler))
            .route("/pool/evict", post(evict_handler))
            .route("/pool/capacity", post(capacity_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.build_app();
        let listener = tokio::net::TcpListener::bind(self.config.addr()).await?;
        let local: SocketAddr = listener.local_addr()?;
        info!(addr = %local, "Engine pool status server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EvictRequest {
    model_path: String,
    #[serde(default = "auto_backend")]
    backend: String,
    #[serde(default)]
    parameters: HashMap<String, String>,
}

fn auto_backend() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize)]
struct CapacityRequest {
    capacity: usize,
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// `GET /metrics`
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(sink) = state.sink.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "metrics are not enabled");
    };
    match sink.render() {
        Ok(body) => ([(header::CONTENT_TYPE, sink.content_type())], body).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to render metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// `GET /health`
async fn health_handler(State(state): State<AppState>) -> Response {
    let shutting_down = state.pool.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if shutting_down { "shutting_down" } else { "ok" },
        "service": "dualgpu-engine-pool",
        "cache_size": state.pool.len(),
        "capacity": state.pool.capacity(),
        "sweeps_running": state.pool.is_running(),
    });
    (status, Json(body)).into_response()
}

/// `GET /pool`
async fn pool_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "stats": state.pool.stats(),
        "entries": state.pool.entries(),
    }))
}

/// `POST /pool/sweep`
async fn sweep_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.health_sweep().await)
}

/// `POST /pool/evict`
async fn evict_handler(
    State(state): State<AppState>,
    Json(request): Json<EvictRequest>,
) -> Response {
    let key = match ModelKey::parse(&request.model_path, &request.backend, &request.parameters) {
        Ok(key) => key,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };
    let evicted = state.pool.evict(&key).await;
    Json(json!({ "model": key.label(), "evicted": evicted })).into_response()
}

/// `POST /pool/capacity`
async fn capacity_handler(
    State(state): State<AppState>,
    Json(request): Json<CapacityRequest>,
) -> Response {
    match state.pool.set_capacity(request.capacity).await {
        Ok(()) => Json(json!({
            "capacity": state.pool.capacity(),
            "cache_size": state.pool.len(),
        }))
        .into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err),
    }
}
