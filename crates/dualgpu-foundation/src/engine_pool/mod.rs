//! EnginePool - bounded cache of loaded inference engines
//!
//! - Get-or-load with at most one in-flight load per [`ModelKey`]
//! - Strict LRU eviction under capacity pressure
//! - Periodic health sweeps with unload and optional proactive reload
//! - Best-effort benchmark recording after each load
//! - Idempotent shutdown
//!
//! A single short-held `parking_lot::Mutex` guards the entry map and the
//! in-flight table. It is never held across an `.await`: loads, probes and
//! unloads all run unlocked.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dualgpu_foundation::backend::MockLauncher;
//! use dualgpu_foundation::engine_pool::{EnginePool, PoolConfig};
//! use dualgpu_kernel::{BackendKind, ModelKey};
//!
//! # async fn demo() -> Result<(), dualgpu_kernel::PoolError> {
//! let pool = EnginePool::builder(Arc::new(MockLauncher::new()))
//!     .config(PoolConfig::default().with_capacity(2))
//!     .build()?;
//!
//! let key = ModelKey::simple("/models/m1.gguf", BackendKind::Mock)?;
//! let _engine = pool.get(&key).await?;
//! assert!(pool.contains(&key));
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod entry;
mod events;
mod health;
mod stats;

pub use config::PoolConfig;
pub use entry::EntrySnapshot;
pub use events::{AlertLevel, EvictionReason, PoolEvent};
pub use health::SweepReport;
pub use stats::PoolStats;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dualgpu_kernel::metrics::names;
use dualgpu_kernel::{
    BackendHandle, BackendLauncher, BenchmarkRecord, BenchmarkStore, GenerationParams,
    MetricsSink, ModelKey, NoopMetricsSink, PoolError, PoolResult, sanitize_label,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::health_probe::ProbeRegistry;
use entry::{CacheEntry, select_lru_victim};
use health::SchedulerHandle;
use stats::PoolCounters;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WARMUP_PROMPT: &str = "Hello, how are you today?";
const WARMUP_MAX_TOKENS: u32 = 16;

type SharedLoad = Shared<BoxFuture<'static, PoolResult<Arc<dyn BackendHandle>>>>;

struct InflightLoad {
    id: u64,
    future: SharedLoad,
}

struct PoolState {
    entries: HashMap<ModelKey, CacheEntry>,
    inflight: HashMap<ModelKey, InflightLoad>,
    capacity: usize,
    next_generation: u64,
    next_load_id: u64,
}

impl PoolState {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            inflight: HashMap::new(),
            capacity,
            next_generation: 0,
            next_load_id: 0,
        }
    }

    /// Pop LRU entries until `len <= capacity`, never choosing `protect`.
    fn take_over_capacity(&mut self, protect: Option<&ModelKey>) -> Vec<CacheEntry> {
        let mut victims = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(victim) = select_lru_victim(&self.entries, protect) else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                victims.push(entry);
            }
        }
        victims
    }
}

struct EnginePoolInner {
    config: PoolConfig,
    launcher: Arc<dyn BackendLauncher>,
    probes: ProbeRegistry,
    metrics: Arc<dyn MetricsSink>,
    benchmarks: Option<Arc<dyn BenchmarkStore>>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    events: broadcast::Sender<PoolEvent>,
    shutting_down: AtomicBool,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

/// Builder for [`EnginePool`].
pub struct EnginePoolBuilder {
    launcher: Arc<dyn BackendLauncher>,
    config: PoolConfig,
    probes: ProbeRegistry,
    metrics: Arc<dyn MetricsSink>,
    benchmarks: Option<Arc<dyn BenchmarkStore>>,
}

impl EnginePoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn benchmark_store(mut self, store: Arc<dyn BenchmarkStore>) -> Self {
        self.benchmarks = Some(store);
        self
    }

    pub fn build(self) -> PoolResult<EnginePool> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let capacity = self.config.capacity;

        info!(
            capacity,
            sweep_interval_secs = self.config.sweep_interval_secs,
            failure_threshold = self.config.health_failure_threshold,
            "Creating engine pool"
        );

        Ok(EnginePool {
            inner: Arc::new(EnginePoolInner {
                config: self.config,
                launcher: self.launcher,
                probes: self.probes,
                metrics: self.metrics,
                benchmarks: self.benchmarks,
                state: Mutex::new(PoolState::new(capacity)),
                counters: PoolCounters::default(),
                events,
                shutting_down: AtomicBool::new(false),
                scheduler: Mutex::new(None),
            }),
        })
    }
}

/// Concurrency-safe, bounded, health-aware cache of loaded engines.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<EnginePoolInner>,
}

impl EnginePool {
    pub fn builder(launcher: Arc<dyn BackendLauncher>) -> EnginePoolBuilder {
        EnginePoolBuilder {
            launcher,
            config: PoolConfig::default(),
            probes: ProbeRegistry::default(),
            metrics: Arc::new(NoopMetricsSink),
            benchmarks: None,
        }
    }

    /// Pool with default probes, no metrics and no benchmark store.
    pub fn new(config: PoolConfig, launcher: Arc<dyn BackendLauncher>) -> PoolResult<Self> {
        Self::builder(launcher).config(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the engine for `key`, loading it on a miss.
    pub async fn get(&self, key: &ModelKey) -> PoolResult<Arc<dyn BackendHandle>> {
        self.get_with_deadline(key, None).await
    }

    /// Like [`get`](Self::get), but gives up waiting after `deadline`.
    ///
    /// A load that outlives the deadline keeps running and still populates
    /// the cache for later callers.
    pub async fn get_with_deadline(
        &self,
        key: &ModelKey,
        deadline: Option<Duration>,
    ) -> PoolResult<Arc<dyn BackendHandle>> {
        if self.is_shutting_down() {
            return Err(PoolError::PoolShuttingDown);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.touch();
                let handle = Arc::clone(&entry.handle);
                drop(state);
                self.record_hit(key);
                return Ok(handle);
            }
            self.start_load(&mut state, key)
        };

        match deadline {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| PoolError::Timeout(limit))?,
            None => pending.await,
        }
    }

    /// Inbound string form: parse and validate a key, then [`get`](Self::get).
    ///
    /// `backend_kind` may be `auto` (or empty) to infer from the path.
    pub async fn request(
        &self,
        model_path: &str,
        backend_kind: &str,
        parameters: &HashMap<String, String>,
    ) -> PoolResult<Arc<dyn BackendHandle>> {
        let key = ModelKey::parse(model_path, backend_kind, parameters)?;
        self.get(&key).await
    }

    /// Remove and unload `key` if resident. Returns whether it was.
    pub async fn evict(&self, key: &ModelKey) -> bool {
        let removed = self.inner.state.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                self.release(entry, EvictionReason::Manual).await;
                self.publish_size();
                true
            }
            None => false,
        }
    }

    /// Change the capacity, evicting LRU entries if it shrank.
    pub async fn set_capacity(&self, capacity: usize) -> PoolResult<()> {
        if capacity == 0 {
            return Err(PoolError::InvalidConfig("capacity must be at least 1".into()));
        }

        let victims = {
            let mut state = self.inner.state.lock();
            let previous = state.capacity;
            state.capacity = capacity;
            info!(previous, capacity, "Engine pool capacity changed");
            state.take_over_capacity(None)
        };

        for victim in victims {
            self.release(victim, EvictionReason::Resize).await;
        }
        self.publish_size();
        Ok(())
    }

    /// Unload every resident engine without shutting the pool down.
    pub async fn clear(&self) -> usize {
        let drained: Vec<CacheEntry> = {
            let mut state = self.inner.state.lock();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.release(entry, EvictionReason::Cleared).await;
        }
        self.publish_size();
        info!(count, "Cleared engine pool");
        count
    }

    /// Stop the sweep scheduler, unload every engine and reject new work.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Engine pool already shut down");
            return;
        }
        info!("Shutting down engine pool");

        self.stop_scheduler().await;

        // In-flight loads see the flag in finalize and unload their own result.
        let inflight: Vec<SharedLoad> = self
            .inner
            .state
            .lock()
            .inflight
            .values()
            .map(|load| load.future.clone())
            .collect();
        if !inflight.is_empty() {
            let grace = self.inner.config.shutdown_grace();
            if tokio::time::timeout(grace, futures::future::join_all(inflight))
                .await
                .is_err()
            {
                warn!(grace_secs = grace.as_secs(), "In-flight loads still running after shutdown grace period");
            }
        }

        let drained: Vec<CacheEntry> = {
            let mut state = self.inner.state.lock();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.release(entry, EvictionReason::Shutdown).await;
        }
        self.publish_size();

        info!(unloaded = count, "Engine pool shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity
    }

    /// Resident engines, most recently used first.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let state = self.inner.state.lock();
        let mut entries: Vec<&CacheEntry> = state.entries.values().collect();
        entries.sort_by(|a, b| {
            (b.last_used, b.generation).cmp(&(a.last_used, a.generation))
        });
        entries.into_iter().map(CacheEntry::snapshot).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        self.inner
            .counters
            .snapshot(state.entries.len(), state.capacity)
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Join the in-flight load for `key`, or start one. Caller holds the lock.
    fn start_load(&self, state: &mut PoolState, key: &ModelKey) -> SharedLoad {
        if let Some(load) = state.inflight.get(key) {
            debug!(model = %key, "Joining in-flight load");
            return load.future.clone();
        }

        state.next_load_id += 1;
        let load_id = state.next_load_id;
        let pool = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move { pool.run_load(task_key, load_id).await });

        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(PoolError::LoadFailed(format!("load task aborted: {err}"))),
            }
        }
        .boxed()
        .shared();

        state.inflight.insert(
            key.clone(),
            InflightLoad {
                id: load_id,
                future: future.clone(),
            },
        );
        future
    }

    async fn run_load(self, key: ModelKey, load_id: u64) -> PoolResult<Arc<dyn BackendHandle>> {
        let _slot = InflightSlot {
            pool: &self,
            key: &key,
            load_id,
        };

        info!(model = %key, "Loading engine");
        let started = Instant::now();
        let loaded = self
            .inner
            .launcher
            .load(&key, self.inner.config.load_timeout())
            .await;
        let load_duration = started.elapsed();

        match loaded {
            Ok(handle) => self.finalize_load(&key, load_id, handle, load_duration).await,
            Err(err) => {
                let err = PoolError::from(err);
                PoolCounters::bump(&self.inner.counters.load_failures);
                let label = sanitize_label(key.model_path());
                self.inner.metrics.increment(
                    names::LOAD_FAILURES,
                    &[("model", label.as_str()), ("backend", key.backend_kind().as_str())],
                );
                warn!(model = %key, error = %err, "Engine load failed");
                self.emit(PoolEvent::LoadFailed {
                    label: key.label(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn finalize_load(
        &self,
        key: &ModelKey,
        load_id: u64,
        handle: Arc<dyn BackendHandle>,
        load_duration: Duration,
    ) -> PoolResult<Arc<dyn BackendHandle>> {
        let admitted = {
            let mut state = self.inner.state.lock();
            if state.inflight.get(key).is_some_and(|load| load.id == load_id) {
                state.inflight.remove(key);
            }

            if self.is_shutting_down() {
                None
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let entry = CacheEntry::new(key.clone(), Arc::clone(&handle), generation, load_duration);
                let replaced = state.entries.insert(key.clone(), entry);
                let mut victims = state.take_over_capacity(Some(key));
                victims.extend(replaced);
                Some(victims)
            }
        };

        let Some(victims) = admitted else {
            info!(model = %key, "Discarding engine loaded during shutdown");
            if let Err(err) = handle.unload().await {
                warn!(model = %key, error = %err, "Failed to unload discarded engine");
            }
            return Err(PoolError::PoolShuttingDown);
        };

        let counters = &self.inner.counters;
        PoolCounters::bump(&counters.misses);
        PoolCounters::bump(&counters.total_loads);

        let label = sanitize_label(key.model_path());
        let labels = [("model", label.as_str()), ("backend", key.backend_kind().as_str())];
        self.inner.metrics.increment(names::CACHE_MISSES, &labels);
        self.inner
            .metrics
            .observe(names::LOAD_SECONDS, load_duration.as_secs_f64(), &labels);

        info!(
            model = %key,
            elapsed_ms = load_duration.as_millis() as u64,
            "Engine loaded"
        );
        self.emit(PoolEvent::Loaded {
            label: key.label(),
            load_ms: load_duration.as_millis() as u64,
        });

        for victim in victims {
            self.release(victim, EvictionReason::Capacity).await;
        }
        self.publish_size();

        self.spawn_benchmark(key, Arc::clone(&handle), load_duration);
        Ok(handle)
    }

    /// Record load and warmup timings without holding up the caller.
    fn spawn_benchmark(&self, key: &ModelKey, handle: Arc<dyn BackendHandle>, load_duration: Duration) {
        let Some(store) = self.inner.benchmarks.clone() else {
            return;
        };
        let warmup = self.inner.config.warmup_benchmark;
        let metrics = Arc::clone(&self.inner.metrics);
        let key = key.clone();

        tokio::spawn(async move {
            let mut first_token_latency = Duration::ZERO;
            let mut tokens_per_second = 0.0;

            if warmup {
                let params = GenerationParams::default().with_max_tokens(WARMUP_MAX_TOKENS);
                match handle.generate(WARMUP_PROMPT, &params).await {
                    Ok(generation) => {
                        first_token_latency = generation.first_token_latency;
                        tokens_per_second = generation.tokens_per_second();
                        let label = sanitize_label(key.model_path());
                        metrics.observe(
                            names::FIRST_TOKEN_SECONDS,
                            first_token_latency.as_secs_f64(),
                            &[("model", label.as_str()), ("backend", key.backend_kind().as_str())],
                        );
                    }
                    Err(err) => debug!(model = %key, error = %err, "Warmup generation failed"),
                }
            }

            let record = BenchmarkRecord::new(
                key.label(),
                load_duration,
                first_token_latency,
                tokens_per_second,
            );
            match store.record(&record).await {
                Ok(()) => debug!(model = %key, tokens_per_second, "Benchmark recorded"),
                Err(err) => warn!(model = %key, error = %err, "Failed to record benchmark"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn record_hit(&self, key: &ModelKey) {
        PoolCounters::bump(&self.inner.counters.hits);
        let label = sanitize_label(key.model_path());
        self.inner.metrics.increment(
            names::CACHE_HITS,
            &[("model", label.as_str()), ("backend", key.backend_kind().as_str())],
        );
        debug!(model = %key, "Engine cache hit");
    }

    /// Unload an entry already removed from the map.
    async fn release(&self, entry: CacheEntry, reason: EvictionReason) {
        let label = sanitize_label(entry.key.model_path());
        let reason_str = reason.to_string();
        let labels = [
            ("model", label.as_str()),
            ("backend", entry.key.backend_kind().as_str()),
            ("reason", reason_str.as_str()),
        ];

        if let Err(err) = entry.handle.unload().await {
            error!(model = %entry.key, error = %err, "Failed to unload engine");
        }

        let counters = &self.inner.counters;
        PoolCounters::bump(&counters.total_unloads);
        self.inner.metrics.increment(names::UNLOADS, &labels);
        if matches!(
            reason,
            EvictionReason::Capacity | EvictionReason::Manual | EvictionReason::Resize
        ) {
            PoolCounters::bump(&counters.evictions);
            self.inner.metrics.increment(names::EVICTIONS, &labels);
        }

        info!(model = %entry.key, %reason, "Engine unloaded");
        self.emit(PoolEvent::Evicted {
            label: entry.key.label(),
            reason,
        });
    }

    fn publish_size(&self) {
        let size = self.len();
        self.inner
            .metrics
            .set_gauge(names::CACHE_SIZE, size as f64, &[]);
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Clears the in-flight slot if the load task ends without finalizing.
struct InflightSlot<'a> {
    pool: &'a EnginePool,
    key: &'a ModelKey,
    load_id: u64,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.inner.state.lock();
        if state
            .inflight
            .get(self.key)
            .is_some_and(|load| load.id == self.load_id)
        {
            state.inflight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLauncher;
    use dualgpu_kernel::BackendKind;

    fn key(path: &str) -> ModelKey {
        ModelKey::simple(path, BackendKind::Mock).unwrap()
    }

    fn pool(capacity: usize, launcher: Arc<MockLauncher>) -> EnginePool {
        EnginePool::new(PoolConfig::default().with_capacity(capacity), launcher).unwrap()
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = pool(2, launcher.clone());

        let first = pool.get(&key("m1")).await.unwrap();
        let second = pool.get(&key("m1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(launcher.load_count(), 1);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test]
    async fn test_evict_returns_presence() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = pool(2, launcher.clone());

        pool.get(&key("m1")).await.unwrap();
        assert!(pool.evict(&key("m1")).await);
        assert!(!pool.evict(&key("m1")).await);
        assert!(!pool.contains(&key("m1")));
        assert_eq!(launcher.backend_for(&key("m1")).unwrap().unload_count(), 1);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_set_capacity_shrinks() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = pool(3, launcher);

        for path in ["a", "b", "c"] {
            pool.get(&key(path)).await.unwrap();
        }
        pool.get(&key("a")).await.unwrap();

        pool.set_capacity(1).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&key("a")));
        assert!(pool.set_capacity(0).await.is_err());
    }

    #[tokio::test]
    async fn test_entries_most_recent_first() {
        let pool = pool(3, Arc::new(MockLauncher::new()));
        for path in ["a", "b", "c"] {
            pool.get(&key(path)).await.unwrap();
        }
        pool.get(&key("a")).await.unwrap();

        let labels: Vec<String> = pool.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["a@mock", "c@mock", "b@mock"]);
    }

    #[tokio::test]
    async fn test_clear_keeps_pool_usable() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = pool(2, launcher.clone());
        pool.get(&key("a")).await.unwrap();
        pool.get(&key("b")).await.unwrap();

        assert_eq!(pool.clear().await, 2);
        assert!(pool.is_empty());

        pool.get(&key("a")).await.unwrap();
        assert_eq!(launcher.load_count(), 3);
    }

    #[tokio::test]
    async fn test_request_rejects_invalid_key() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = pool(2, launcher.clone());

        let err = pool
            .request("   ", "mock", &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::InvalidKey(_)));

        let err = pool
            .request("/m", "tensorrt", &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::InvalidKey(_)));
        assert_eq!(launcher.load_count(), 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let pool = pool(1, Arc::new(MockLauncher::new()));
        let mut events = pool.subscribe();

        pool.get(&key("a")).await.unwrap();
        pool.get(&key("b")).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Loaded { .. }));
        let mut saw_capacity_eviction = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Evicted { label, reason } = event {
                assert_eq!(label, "a@mock");
                assert_eq!(reason, EvictionReason::Capacity);
                saw_capacity_eviction = true;
            }
        }
        assert!(saw_capacity_eviction);
    }
}
