//! Pool fixtures: keys, pools over a [`MockLauncher`], and a benchmark store
//! that can be told to fail or stall.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dualgpu_foundation::backend::MockLauncher;
use dualgpu_foundation::engine_pool::{EnginePool, PoolConfig};
use dualgpu_foundation::metrics::RecordingMetricsSink;
use dualgpu_kernel::{
    BackendKind, BenchmarkRecord, BenchmarkStore, ModelKey, ModelPerformance, StoreError,
    StoreResult,
};

pub fn mock_key(path: &str) -> ModelKey {
    ModelKey::simple(path, BackendKind::Mock).expect("valid key")
}

/// Pool, launcher and metrics wired together.
pub struct Harness {
    pub pool: EnginePool,
    pub launcher: Arc<MockLauncher>,
    pub metrics: Arc<RecordingMetricsSink>,
}

impl Harness {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_launcher(config, MockLauncher::new())
    }

    pub fn with_launcher(config: PoolConfig, launcher: MockLauncher) -> Self {
        let launcher = Arc::new(launcher);
        let metrics = Arc::new(RecordingMetricsSink::new());
        let pool = EnginePool::builder(launcher.clone())
            .config(config)
            .metrics(metrics.clone())
            .build()
            .expect("valid pool config");
        Self {
            pool,
            launcher,
            metrics,
        }
    }

    pub fn with_store(
        config: PoolConfig,
        launcher: MockLauncher,
        store: Arc<dyn BenchmarkStore>,
    ) -> Self {
        let launcher = Arc::new(launcher);
        let metrics = Arc::new(RecordingMetricsSink::new());
        let pool = EnginePool::builder(launcher.clone())
            .config(config)
            .metrics(metrics.clone())
            .benchmark_store(store)
            .build()
            .expect("valid pool config");
        Self {
            pool,
            launcher,
            metrics,
        }
    }

    pub fn resident(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.pool.entries().into_iter().map(|e| e.model_path).collect();
        labels.sort();
        labels
    }
}

// ============================================================================
// Benchmark store doubles
// ============================================================================

/// Benchmark store whose `record` stalls for `delay` and then fails.
pub struct FailingStore {
    delay: Duration,
    attempts: AtomicU32,
}

impl FailingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BenchmarkStore for FailingStore {
    async fn record(&self, _record: &BenchmarkRecord) -> StoreResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Err(StoreError::Connection("database is locked".into()))
    }

    async fn query_recent(
        &self,
        _model_key_label: &str,
        _limit: usize,
    ) -> StoreResult<Vec<BenchmarkRecord>> {
        Ok(Vec::new())
    }

    async fn fastest_models(&self, _limit: usize) -> StoreResult<Vec<ModelPerformance>> {
        Ok(Vec::new())
    }

    async fn clear(&self, _model_key_label: Option<&str>) -> StoreResult<u64> {
        Ok(0)
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
