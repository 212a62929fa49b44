//! Health sweeps and the background sweep scheduler.

use std::sync::Arc;
use std::time::Duration;

use dualgpu_kernel::metrics::names;
use dualgpu_kernel::{BackendHandle, ModelKey, ProbeOutcome, sanitize_label};
use futures::future::BoxFuture;
use futures::stream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::entry::CacheEntry;
use super::events::{AlertLevel, EvictionReason, PoolEvent};
use super::stats::PoolCounters;
use super::{EnginePool, EnginePoolInner};

/// Outcome of one [`EnginePool::health_sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries whose probe succeeded
    pub healthy: usize,
    /// Entries that failed but are still under the threshold
    pub degraded: usize,
    /// Entries removed for reaching the threshold
    pub unloaded: usize,
    /// Background reloads started for unloaded entries
    pub reload_scheduled: usize,
}

pub(crate) struct SchedulerHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

struct Unhealthy {
    entry: CacheEntry,
    reason: String,
    recently_used: bool,
}

impl EnginePool {
    /// Probe every resident engine once.
    ///
    /// Entries are snapshotted under the lock, probed unlocked with at most
    /// `probe_concurrency` probes in flight, and results are applied under a
    /// second short lock. Results for entries that were evicted or replaced
    /// meanwhile are dropped.
    pub async fn health_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.is_shutting_down() {
            return report;
        }

        let snapshot: Vec<(ModelKey, u64, Arc<dyn BackendHandle>)> = {
            let state = self.inner.state.lock();
            state
                .entries
                .values()
                .map(|entry| (entry.key.clone(), entry.generation, Arc::clone(&entry.handle)))
                .collect()
        };
        if snapshot.is_empty() {
            return report;
        }

        let timeout = self.inner.config.probe_timeout();
        let probes: Vec<BoxFuture<'static, (ModelKey, u64, ProbeOutcome)>> = snapshot
            .into_iter()
            .map(|(key, generation, handle)| {
                let probe = self.inner.probes.probe_for(key.backend_kind());
                async move {
                    let outcome = tokio::time::timeout(timeout, probe.probe(handle.as_ref(), timeout))
                        .await
                        .unwrap_or_else(|_| ProbeOutcome::timeout());
                    (key, generation, outcome)
                }
                .boxed()
            })
            .collect();
        let outcomes: Vec<(ModelKey, u64, ProbeOutcome)> = stream::iter(probes)
            .buffer_unordered(self.inner.config.probe_concurrency)
            .collect()
            .await;

        let threshold = self.inner.config.health_failure_threshold;
        let reload_window = self.inner.config.reload_window();
        let mut removed = Vec::new();
        let mut recovered = Vec::new();
        let mut failed: Vec<(ModelKey, String, u32)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for (key, generation, outcome) in &outcomes {
                let Some(entry) = state.entries.get_mut(key) else {
                    continue;
                };
                if entry.generation != *generation {
                    continue;
                }

                let reason = match outcome {
                    ProbeOutcome::Healthy => {
                        if entry.consecutive_failures > 0 {
                            recovered.push(key.clone());
                        }
                        entry.consecutive_failures = 0;
                        report.healthy += 1;
                        continue;
                    }
                    ProbeOutcome::Unhealthy(reason) => reason.clone(),
                };

                entry.consecutive_failures += 1;
                let failures = entry.consecutive_failures;
                let recently_used = entry.last_used.elapsed() <= reload_window;
                failed.push((key.clone(), reason.clone(), failures));

                if failures < threshold {
                    report.degraded += 1;
                    continue;
                }
                if let Some(entry) = state.entries.remove(key) {
                    removed.push(Unhealthy {
                        entry,
                        reason,
                        recently_used,
                    });
                }
            }
        }

        // Sinks and subscribers may read pool state, so none run under the lock.
        for (key, _, outcome) in &outcomes {
            self.count_probe(key, outcome);
        }
        for key in recovered {
            info!(model = %key, "Engine recovered");
        }
        for (key, reason, failures) in failed {
            warn!(model = %key, %reason, failures, threshold, "Engine health check failed");
            self.emit(PoolEvent::HealthFailed {
                label: key.label(),
                reason,
                consecutive_failures: failures,
            });
        }

        for unhealthy in removed {
            let key = unhealthy.entry.key.clone();
            self.raise_critical(&key, &unhealthy.reason);
            self.release(unhealthy.entry, EvictionReason::Unhealthy).await;
            self.emit(PoolEvent::Unloaded {
                label: key.label(),
                reason: unhealthy.reason,
            });
            report.unloaded += 1;

            if self.inner.config.proactive_reload && unhealthy.recently_used && self.schedule_reload(&key) {
                report.reload_scheduled += 1;
            }
        }

        if report.unloaded > 0 {
            self.publish_size();
        }
        debug!(
            healthy = report.healthy,
            degraded = report.degraded,
            unloaded = report.unloaded,
            reload_scheduled = report.reload_scheduled,
            "Health sweep complete"
        );
        report
    }

    /// Start the periodic sweep task. A second call is a no-op.
    pub fn start(&self) {
        if self.is_shutting_down() {
            warn!("Not starting health sweeps on a shut down pool");
            return;
        }

        let mut slot = self.inner.scheduler.lock();
        if slot.is_some() {
            debug!("Health sweep scheduler already running");
            return;
        }

        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let pool = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = interval.tick() => {
                        let Some(inner) = pool.upgrade() else { break };
                        let pool = EnginePool { inner };
                        if pool.is_shutting_down() {
                            break;
                        }
                        pool.health_sweep().await;
                    }
                }
            }
            debug!("Health sweep scheduler stopped");
        });

        info!(interval_secs = period.as_secs(), "Started health sweep scheduler");
        *slot = Some(SchedulerHandle { stop, task });
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.lock().is_some()
    }

    pub(super) async fn stop_scheduler(&self) {
        let handle = self.inner.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.stop.notify_one();
            if let Err(err) = handle.task.await {
                warn!(error = %err, "Health sweep scheduler ended abnormally");
            }
        }
    }

    /// Start a reload for `key` unless it is resident or already loading.
    fn schedule_reload(&self, key: &ModelKey) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.entries.contains_key(key) || state.inflight.contains_key(key) {
            return false;
        }
        let _ = self.start_load(&mut state, key);
        drop(state);

        PoolCounters::bump(&self.inner.counters.auto_restarts);
        let label = sanitize_label(key.model_path());
        self.inner.metrics.increment(
            names::AUTO_RESTARTS,
            &[("model", label.as_str()), ("backend", key.backend_kind().as_str())],
        );
        info!(model = %key, "Scheduled proactive reload");
        self.emit(PoolEvent::ReloadScheduled { label: key.label() });
        true
    }

    fn count_probe(&self, key: &ModelKey, outcome: &ProbeOutcome) {
        let counters = &self.inner.counters;
        let label = sanitize_label(key.model_path());
        let labels = [("model", label.as_str()), ("backend", key.backend_kind().as_str())];

        PoolCounters::bump(&counters.health_checks);
        self.inner.metrics.increment(names::HEALTH_CHECKS, &labels);
        if !outcome.is_healthy() {
            PoolCounters::bump(&counters.health_failures);
            self.inner.metrics.increment(names::HEALTH_FAILURES, &labels);
        }
    }

    fn raise_critical(&self, key: &ModelKey, reason: &str) {
        let message = format!(
            "engine {} unloaded after {} consecutive health check failures: {}",
            key.label(),
            self.inner.config.health_failure_threshold,
            reason
        );
        error!(model = %key, %reason, "CRITICAL: {message}");
        self.emit(PoolEvent::Alert {
            level: AlertLevel::Critical,
            message,
        });
    }
}

impl Drop for EnginePoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLauncher;
    use crate::engine_pool::PoolConfig;
    use dualgpu_kernel::BackendKind;

    fn key(path: &str) -> ModelKey {
        ModelKey::simple(path, BackendKind::Mock).unwrap()
    }

    /// Sink that reads pool state on every sample.
    #[derive(Default)]
    struct PoolReadingSink {
        pool: std::sync::OnceLock<EnginePool>,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl PoolReadingSink {
        fn read(&self) {
            if let Some(pool) = self.pool.get() {
                let _ = pool.len();
                self.reads
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    impl dualgpu_kernel::MetricsSink for PoolReadingSink {
        fn increment(&self, _counter_name: &str, _labels: dualgpu_kernel::metrics::Labels<'_>) {
            self.read();
        }

        fn observe(&self, _histogram_name: &str, _value: f64, _labels: dualgpu_kernel::metrics::Labels<'_>) {
            self.read();
        }
    }

    #[tokio::test]
    async fn test_sweep_counts_degraded_then_unloads() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default().with_health_failure_threshold(2),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        launcher.backend_for(&key("m1")).unwrap().set_healthy(false);

        let first = pool.health_sweep().await;
        assert_eq!(first.degraded, 1);
        assert_eq!(pool.entries()[0].consecutive_failures, 1);

        let second = pool.health_sweep().await;
        assert_eq!(second.unloaded, 1);
        assert!(!pool.contains(&key("m1")));
        assert_eq!(pool.stats().health_failures, 2);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(PoolConfig::default(), launcher.clone()).unwrap();

        pool.get(&key("m1")).await.unwrap();
        let backend = launcher.backend_for(&key("m1")).unwrap();

        backend.set_healthy(false);
        pool.health_sweep().await;
        pool.health_sweep().await;
        backend.set_healthy(true);
        let report = pool.health_sweep().await;

        assert_eq!(report.healthy, 1);
        assert_eq!(pool.entries()[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default()
                .with_probe_timeout(Duration::from_millis(20))
                .with_health_failure_threshold(1),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        launcher
            .backend_for(&key("m1"))
            .unwrap()
            .set_health_delay(Duration::from_secs(5));

        let mut events = pool.subscribe();
        let report = pool.health_sweep().await;
        assert_eq!(report.unloaded, 1);

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::HealthFailed { reason, .. } = event {
                saw_timeout = reason == "timeout";
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn test_critical_alert_on_unload() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default().with_health_failure_threshold(1),
            launcher.clone(),
        )
        .unwrap();
        pool.get(&key("m1")).await.unwrap();
        launcher.backend_for(&key("m1")).unwrap().set_healthy(false);

        let mut events = pool.subscribe();
        pool.health_sweep().await;

        let mut alert = None;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::Alert { level, message } = event {
                alert = Some((level, message));
            }
        }
        let (level, message) = alert.expect("critical alert");
        assert_eq!(level, AlertLevel::Critical);
        assert!(message.contains("m1@mock"));
    }

    #[tokio::test]
    async fn test_proactive_reload_of_recent_entry() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default()
                .with_health_failure_threshold(1)
                .with_proactive_reload(true),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        launcher.backend_for(&key("m1")).unwrap().set_healthy(false);

        let report = pool.health_sweep().await;
        assert_eq!(report.unloaded, 1);
        assert_eq!(report.reload_scheduled, 1);

        // Joins the reload rather than starting another load.
        let engine = pool.get(&key("m1")).await.unwrap();
        assert_eq!(launcher.load_count(), 2);
        assert!(engine.health_check().await.is_ok());
        assert_eq!(pool.stats().auto_restarts, 1);
    }

    #[tokio::test]
    async fn test_no_reload_when_disabled() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default().with_health_failure_threshold(1),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        launcher.backend_for(&key("m1")).unwrap().set_healthy(false);

        let report = pool.health_sweep().await;
        assert_eq!(report.reload_scheduled, 0);
        tokio::task::yield_now().await;
        assert_eq!(launcher.load_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_does_not_hold_lock_while_reporting() {
        let launcher = Arc::new(MockLauncher::new());
        let sink = Arc::new(PoolReadingSink::default());
        let pool = EnginePool::builder(launcher.clone())
            .config(PoolConfig::default().with_health_failure_threshold(1))
            .metrics(sink.clone())
            .build()
            .unwrap();
        let _ = sink.pool.set(pool.clone());

        pool.get(&key("m1")).await.unwrap();
        pool.get(&key("m2")).await.unwrap();
        launcher.backend_for(&key("m2")).unwrap().set_healthy(false);

        let mut events = pool.subscribe();
        let reads_before = sink.reads.load(std::sync::atomic::Ordering::SeqCst);
        let report = tokio::time::timeout(Duration::from_secs(3), pool.health_sweep())
            .await
            .expect("sweep finishes while the sink reads the pool");

        assert_eq!(report.healthy, 1);
        assert_eq!(report.unloaded, 1);
        assert!(sink.reads.load(std::sync::atomic::Ordering::SeqCst) >= reads_before + 3);
        assert_eq!(pool.stats().health_checks, 2);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::HealthFailed { label, .. } = event {
                saw_failure = label == key("m2").label();
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_skipped_when_load_already_running() {
        let launcher = Arc::new(MockLauncher::new().with_load_latency(Duration::from_millis(500)));
        let pool = EnginePool::new(
            PoolConfig::default()
                .with_health_failure_threshold(1)
                .with_proactive_reload(true),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        let backend = launcher.backend_for(&key("m1")).unwrap();
        backend.set_healthy(false);
        backend.set_unload_delay(Duration::from_millis(100));

        let sweep = tokio::spawn({
            let pool = pool.clone();
            async move { pool.health_sweep().await }
        });
        // The sweep is now inside the slow unload; a caller starts the reload first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let caller = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get(&key("m1")).await.map(|_| ()) }
        });

        let report = sweep.await.unwrap();
        assert_eq!(report.unloaded, 1);
        assert_eq!(report.reload_scheduled, 0);

        caller.await.unwrap().unwrap();
        assert!(pool.contains(&key("m1")));
        assert_eq!(launcher.load_count(), 2);
        assert_eq!(pool.stats().auto_restarts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_sweeps_periodically() {
        let launcher = Arc::new(MockLauncher::new());
        let pool = EnginePool::new(
            PoolConfig::default()
                .with_sweep_interval_secs(1)
                .with_health_failure_threshold(2),
            launcher.clone(),
        )
        .unwrap();

        pool.get(&key("m1")).await.unwrap();
        launcher.backend_for(&key("m1")).unwrap().set_healthy(false);

        pool.start();
        pool.start();
        assert!(pool.is_running());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!pool.contains(&key("m1")));

        pool.shutdown().await;
        assert!(!pool.is_running());
    }
}
