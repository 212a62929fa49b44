use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub total_loads: AtomicU64,
    pub total_unloads: AtomicU64,
    pub evictions: AtomicU64,
    pub health_checks: AtomicU64,
    pub health_failures: AtomicU64,
    pub auto_restarts: AtomicU64,
    pub load_failures: AtomicU64,
}

impl PoolCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache_size: usize, capacity: usize) -> PoolStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let requests = hits + misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64 * 100.0
        };

        PoolStats {
            cache_size,
            capacity,
            hits,
            misses,
            hit_rate,
            total_loads: self.total_loads.load(Ordering::Relaxed),
            total_unloads: self.total_unloads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            health_failures: self.health_failures.load(Ordering::Relaxed),
            auto_restarts: self.auto_restarts.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub cache_size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of requests served from cache; 0 before any request
    pub hit_rate: f64,
    pub total_loads: u64,
    pub total_unloads: u64,
    pub evictions: u64,
    pub health_checks: u64,
    pub health_failures: u64,
    pub auto_restarts: u64,
    pub load_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_zero_without_requests() {
        let counters = PoolCounters::default();
        let stats = counters.snapshot(0, 2);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn test_hit_rate_percentage() {
        let counters = PoolCounters::default();
        for _ in 0..3 {
            PoolCounters::bump(&counters.hits);
        }
        PoolCounters::bump(&counters.misses);
        let stats = counters.snapshot(1, 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 75.0);
    }
}
