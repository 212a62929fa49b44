//! Backend handles and launchers.
//!
//! A [`BackendHandle`] is one loaded, ready-to-use engine. The pool owns every
//! handle it caches; callers borrow them through an `Arc` and must not hold
//! on to them across pool calls, since the pool may unload the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;
use crate::model_key::{BackendKind, ModelKey};

/// Sampling parameters for a single generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 0.7,
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Output of a generation call together with its timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens: u32,
    pub first_token_latency: Duration,
    pub total_duration: Duration,
}

impl Generation {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.total_duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.tokens as f64 / secs
    }
}

/// One loaded model instance.
#[async_trait]
pub trait BackendHandle: Send + Sync {
    /// Runtime serving this handle
    fn kind(&self) -> BackendKind;

    /// Path or identifier of the loaded model
    fn model_path(&self) -> &str;

    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation>;

    /// Cheap self-reported liveness check.
    async fn health_check(&self) -> BackendResult<()>;

    /// Release the engine's resources. Must be idempotent.
    async fn unload(&self) -> BackendResult<()>;
}

/// Produces loaded handles for model keys.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Load the model described by `key`, giving up after `timeout` if set.
    async fn load(
        &self,
        key: &ModelKey,
        timeout: Option<Duration>,
    ) -> BackendResult<Arc<dyn BackendHandle>>;
}
