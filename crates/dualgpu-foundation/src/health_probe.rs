//! Health probes and the per-backend probe registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dualgpu_kernel::{BackendHandle, BackendKind, GenerationParams, HealthProbe, ProbeOutcome};

const PING_PROMPT: &str = "ping";

/// Delegates to [`BackendHandle::health_check`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleProbe;

#[async_trait]
impl HealthProbe for HandleProbe {
    async fn probe(&self, handle: &dyn BackendHandle, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, handle.health_check()).await {
            Ok(Ok(())) => ProbeOutcome::Healthy,
            Ok(Err(err)) => ProbeOutcome::Unhealthy(err.to_string()),
            Err(_) => ProbeOutcome::timeout(),
        }
    }
}

/// Runs a one-token generation; catches engines that are up but wedged.
#[derive(Debug, Clone, Default)]
pub struct GenerationProbe {
    prompt: Option<String>,
}

impl GenerationProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

#[async_trait]
impl HealthProbe for GenerationProbe {
    async fn probe(&self, handle: &dyn BackendHandle, timeout: Duration) -> ProbeOutcome {
        let prompt = self.prompt.as_deref().unwrap_or(PING_PROMPT);
        let params = GenerationParams::default()
            .with_max_tokens(1)
            .with_temperature(0.0);

        match tokio::time::timeout(timeout, handle.generate(prompt, &params)).await {
            Ok(Ok(_)) => ProbeOutcome::Healthy,
            Ok(Err(err)) => ProbeOutcome::Unhealthy(err.to_string()),
            Err(_) => ProbeOutcome::timeout(),
        }
    }
}

/// Maps backend kinds to probes, falling back to a default.
#[derive(Clone)]
pub struct ProbeRegistry {
    fallback: Arc<dyn HealthProbe>,
    by_kind: HashMap<BackendKind, Arc<dyn HealthProbe>>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new(Arc::new(HandleProbe))
    }
}

impl ProbeRegistry {
    pub fn new(fallback: Arc<dyn HealthProbe>) -> Self {
        Self {
            fallback,
            by_kind: HashMap::new(),
        }
    }

    pub fn with_probe(mut self, kind: BackendKind, probe: Arc<dyn HealthProbe>) -> Self {
        self.by_kind.insert(kind, probe);
        self
    }

    pub fn probe_for(&self, kind: BackendKind) -> Arc<dyn HealthProbe> {
        self.by_kind
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

#[async_trait]
impl HealthProbe for ProbeRegistry {
    async fn probe(&self, handle: &dyn BackendHandle, timeout: Duration) -> ProbeOutcome {
        self.probe_for(handle.kind()).probe(handle, timeout).await
    }
}
