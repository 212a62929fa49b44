//! In-process mock backend.
//!
//! Serves the `mock` backend kind and doubles as a scriptable launcher for
//! tests: load latency, injected load failures, health toggles and
//! per-key load/unload counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dualgpu_kernel::{
    BackendError, BackendHandle, BackendKind, BackendLauncher, BackendResult, Generation,
    GenerationParams, ModelKey,
};
use parking_lot::Mutex;
use tracing::debug;

// ============================================================================
// Backend
// ============================================================================

/// A fake engine that echoes prompts.
#[derive(Debug)]
pub struct MockBackend {
    model_path: String,
    generation_latency: Duration,
    healthy: AtomicBool,
    unloaded: AtomicBool,
    health_delay_ms: AtomicU64,
    unload_delay_ms: AtomicU64,
    unload_count: AtomicU32,
    generate_count: AtomicU32,
}

impl MockBackend {
    pub fn new(model_path: impl Into<String>, generation_latency: Duration) -> Self {
        Self {
            model_path: model_path.into(),
            generation_latency,
            healthy: AtomicBool::new(true),
            unloaded: AtomicBool::new(false),
            health_delay_ms: AtomicU64::new(0),
            unload_delay_ms: AtomicU64::new(0),
            unload_count: AtomicU32::new(0),
            generate_count: AtomicU32::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `health_check` stall, to exercise probe timeouts.
    pub fn set_health_delay(&self, delay: Duration) {
        self.health_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_unload_delay(&self, delay: Duration) {
        self.unload_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    /// Number of times resources were actually released.
    pub fn unload_count(&self) -> u32 {
        self.unload_count.load(Ordering::SeqCst)
    }

    pub fn generate_count(&self) -> u32 {
        self.generate_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendHandle for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn model_path(&self) -> &str {
        &self.model_path
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation> {
        if self.is_unloaded() {
            return Err(BackendError::Request("engine has been unloaded".into()));
        }
        self.generate_count.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        tokio::time::sleep(self.generation_latency / 4).await;
        let first_token_latency = started.elapsed();
        tokio::time::sleep(self.generation_latency - self.generation_latency / 4).await;

        let preview: String = prompt.chars().take(20).collect();
        let text = format!("Response to: {preview}...");
        let tokens = (text.split_whitespace().count() as u32).min(params.max_tokens.max(1));

        Ok(Generation {
            text,
            tokens,
            first_token_latency,
            total_duration: started.elapsed(),
        })
    }

    async fn health_check(&self) -> BackendResult<()> {
        let delay = self.health_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_unloaded() {
            return Err(BackendError::Unhealthy("engine has been unloaded".into()));
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BackendError::Unhealthy("mock engine marked unhealthy".into()));
        }
        Ok(())
    }

    async fn unload(&self) -> BackendResult<()> {
        let delay = self.unload_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.unloaded.swap(true, Ordering::SeqCst) {
            self.unload_count.fetch_add(1, Ordering::SeqCst);
            debug!(model = %self.model_path, "Mock engine unloaded");
        }
        Ok(())
    }
}

// ============================================================================
// Launcher
// ============================================================================

#[derive(Default)]
struct LauncherState {
    loads: HashMap<ModelKey, u32>,
    backends: HashMap<ModelKey, Arc<MockBackend>>,
    fail_next: u32,
    failing_paths: HashSet<String>,
}

/// Launcher producing [`MockBackend`]s.
pub struct MockLauncher {
    load_latency: Duration,
    generation_latency: Duration,
    state: Mutex<LauncherState>,
    total_loads: AtomicU32,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            load_latency: Duration::ZERO,
            generation_latency: Duration::from_millis(5),
            state: Mutex::new(LauncherState::default()),
            total_loads: AtomicU32::new(0),
        }
    }

    pub fn with_load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    pub fn with_generation_latency(mut self, latency: Duration) -> Self {
        self.generation_latency = latency;
        self
    }

    /// Fail the next `count` loads, whatever their key.
    pub fn fail_next_loads(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Fail every load of `model_path` until [`allow_path`](Self::allow_path).
    pub fn fail_path(&self, model_path: impl Into<String>) {
        self.state.lock().failing_paths.insert(model_path.into());
    }

    pub fn allow_path(&self, model_path: &str) {
        self.state.lock().failing_paths.remove(model_path);
    }

    /// Launcher invocations, including failed ones.
    pub fn load_count(&self) -> u32 {
        self.total_loads.load(Ordering::SeqCst)
    }

    pub fn load_count_for(&self, key: &ModelKey) -> u32 {
        self.state.lock().loads.get(key).copied().unwrap_or(0)
    }

    /// Most recent backend produced for `key`.
    pub fn backend_for(&self, key: &ModelKey) -> Option<Arc<MockBackend>> {
        self.state.lock().backends.get(key).cloned()
    }
}

#[async_trait]
impl BackendLauncher for MockLauncher {
    async fn load(
        &self,
        key: &ModelKey,
        timeout: Option<Duration>,
    ) -> BackendResult<Arc<dyn BackendHandle>> {
        self.total_loads.fetch_add(1, Ordering::SeqCst);
        let should_fail = {
            let mut state = self.state.lock();
            *state.loads.entry(key.clone()).or_insert(0) += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                true
            } else {
                state.failing_paths.contains(key.model_path())
            }
        };

        if let Some(limit) = timeout {
            if self.load_latency > limit {
                tokio::time::sleep(limit).await;
                return Err(BackendError::NotReady(format!(
                    "mock engine not ready within {limit:?}"
                )));
            }
        }
        if !self.load_latency.is_zero() {
            tokio::time::sleep(self.load_latency).await;
        }

        if should_fail {
            return Err(BackendError::Launch(format!(
                "injected failure for {}",
                key.model_path()
            )));
        }

        let backend = Arc::new(MockBackend::new(key.model_path(), self.generation_latency));
        self.state
            .lock()
            .backends
            .insert(key.clone(), Arc::clone(&backend));
        debug!(model = %key, "Mock engine loaded");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> ModelKey {
        ModelKey::simple(path, BackendKind::Mock).unwrap()
    }

    #[tokio::test]
    async fn test_mock_generate_and_unload() {
        let launcher = MockLauncher::new();
        let handle = launcher.load(&key("/m"), None).await.unwrap();

        let out = handle
            .generate("Hello there", &GenerationParams::default())
            .await
            .unwrap();
        assert!(out.text.starts_with("Response to: Hello there"));
        assert!(out.tokens > 0);

        handle.unload().await.unwrap();
        handle.unload().await.unwrap();
        let backend = launcher.backend_for(&key("/m")).unwrap();
        assert_eq!(backend.unload_count(), 1);
        assert!(handle.generate("x", &GenerationParams::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let launcher = MockLauncher::new();
        launcher.fail_next_loads(1);
        assert!(launcher.load(&key("/m"), None).await.is_err());
        assert!(launcher.load(&key("/m"), None).await.is_ok());

        launcher.fail_path("/bad");
        assert!(launcher.load(&key("/bad"), None).await.is_err());
        launcher.allow_path("/bad");
        assert!(launcher.load(&key("/bad"), None).await.is_ok());

        assert_eq!(launcher.load_count(), 4);
        assert_eq!(launcher.load_count_for(&key("/bad")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_timeout() {
        let launcher = MockLauncher::new().with_load_latency(Duration::from_secs(10));
        let err = launcher
            .load(&key("/slow"), Some(Duration::from_secs(1)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::NotReady(_)));
    }
}
