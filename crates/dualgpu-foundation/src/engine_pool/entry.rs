//! Cache entries and LRU victim selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dualgpu_kernel::{BackendHandle, BackendKind, HealthState, ModelKey};
use serde::Serialize;

/// A resident engine. Only mutated under the pool lock.
pub(crate) struct CacheEntry {
    pub key: ModelKey,
    pub handle: Arc<dyn BackendHandle>,
    /// Unique per insertion; also the insertion order used for LRU ties.
    pub generation: u64,
    pub last_used: Instant,
    pub inserted_at: Instant,
    pub load_duration: Duration,
    pub consecutive_failures: u32,
}

impl CacheEntry {
    pub fn new(
        key: ModelKey,
        handle: Arc<dyn BackendHandle>,
        generation: u64,
        load_duration: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            handle,
            generation,
            last_used: now,
            inserted_at: now,
            load_duration,
            consecutive_failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_failures(self.consecutive_failures)
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            label: self.key.label(),
            model_path: self.key.model_path().to_string(),
            backend_kind: self.key.backend_kind(),
            idle_ms: self.last_used.elapsed().as_millis() as u64,
            age_ms: self.inserted_at.elapsed().as_millis() as u64,
            load_duration_ms: self.load_duration.as_millis() as u64,
            consecutive_failures: self.consecutive_failures,
            health: self.health(),
        }
    }
}

/// Read-only view of a resident engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub label: String,
    pub model_path: String,
    pub backend_kind: BackendKind,
    /// Time since the last hit or insertion
    pub idle_ms: u64,
    /// Time since insertion
    pub age_ms: u64,
    pub load_duration_ms: u64,
    pub consecutive_failures: u32,
    pub health: HealthState,
}

/// Least recently used entry, oldest insertion first on ties. `protect` is
/// never chosen.
pub(crate) fn select_lru_victim(
    entries: &HashMap<ModelKey, CacheEntry>,
    protect: Option<&ModelKey>,
) -> Option<ModelKey> {
    entries
        .values()
        .filter(|entry| Some(&entry.key) != protect)
        .min_by_key(|entry| (entry.last_used, entry.generation))
        .map(|entry| entry.key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dualgpu_kernel::{BackendResult, Generation, GenerationParams};

    struct NullHandle;

    #[async_trait]
    impl BackendHandle for NullHandle {
        fn kind(&self) -> BackendKind {
            BackendKind::Mock
        }

        fn model_path(&self) -> &str {
            "null"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> BackendResult<Generation> {
            unreachable!("not used in entry tests")
        }

        async fn health_check(&self) -> BackendResult<()> {
            Ok(())
        }

        async fn unload(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    fn key(path: &str) -> ModelKey {
        ModelKey::simple(path, BackendKind::Mock).unwrap()
    }

    fn entries(paths: &[&str]) -> HashMap<ModelKey, CacheEntry> {
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let entry = CacheEntry::new(key(path), Arc::new(NullHandle), i as u64, Duration::ZERO);
                (entry.key.clone(), entry)
            })
            .collect()
    }

    #[test]
    fn test_lru_tie_breaks_by_insertion_order() {
        let mut map = entries(&["a", "b", "c"]);
        let stamp = Instant::now();
        for entry in map.values_mut() {
            entry.last_used = stamp;
        }
        assert_eq!(select_lru_victim(&map, None), Some(key("a")));
    }

    #[test]
    fn test_lru_prefers_oldest_last_used() {
        let mut map = entries(&["a", "b"]);
        let base = Instant::now();
        map.get_mut(&key("a")).unwrap().last_used = base + Duration::from_millis(10);
        map.get_mut(&key("b")).unwrap().last_used = base;
        assert_eq!(select_lru_victim(&map, None), Some(key("b")));
    }

    #[test]
    fn test_lru_skips_protected_key() {
        let map = entries(&["a", "b"]);
        assert_eq!(select_lru_victim(&map, Some(&key("a"))), Some(key("b")));

        let single = entries(&["a"]);
        assert_eq!(select_lru_victim(&single, Some(&key("a"))), None);
    }

    #[test]
    fn test_snapshot_reports_health() {
        let mut map = entries(&["a"]);
        let entry = map.get_mut(&key("a")).unwrap();
        assert_eq!(entry.snapshot().health, HealthState::Healthy);
        entry.consecutive_failures = 2;
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.health, HealthState::Degraded);
        assert_eq!(snapshot.label, "a@mock");
    }
}
