//! In-memory benchmark store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dualgpu_kernel::{BenchmarkRecord, BenchmarkStore, ModelPerformance, StoreResult};
use parking_lot::RwLock;

/// Keeps records in insertion order; lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryBenchmarkStore {
    records: RwLock<Vec<BenchmarkRecord>>,
}

impl InMemoryBenchmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl BenchmarkStore for InMemoryBenchmarkStore {
    async fn record(&self, record: &BenchmarkRecord) -> StoreResult<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn query_recent(
        &self,
        model_key_label: &str,
        limit: usize,
    ) -> StoreResult<Vec<BenchmarkRecord>> {
        let records = self.records.read();
        // Later pushes win ties on recorded_at.
        let mut matching: Vec<(usize, &BenchmarkRecord)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.model_key_label == model_key_label)
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| b.recorded_at.cmp(&a.recorded_at).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn fastest_models(&self, limit: usize) -> StoreResult<Vec<ModelPerformance>> {
        struct Acc {
            tps_sum: f64,
            best: f64,
            load_sum: Duration,
            samples: u64,
        }

        let records = self.records.read();
        let mut by_label: HashMap<&str, Acc> = HashMap::new();
        for record in records.iter() {
            let acc = by_label
                .entry(record.model_key_label.as_str())
                .or_insert(Acc {
                    tps_sum: 0.0,
                    best: f64::MIN,
                    load_sum: Duration::ZERO,
                    samples: 0,
                });
            acc.tps_sum += record.tokens_per_second;
            acc.best = acc.best.max(record.tokens_per_second);
            acc.load_sum += record.load_duration;
            acc.samples += 1;
        }

        let mut ranked: Vec<ModelPerformance> = by_label
            .into_iter()
            .map(|(label, acc)| ModelPerformance {
                model_key_label: label.to_string(),
                avg_tokens_per_second: acc.tps_sum / acc.samples as f64,
                best_tokens_per_second: acc.best,
                avg_load_duration: acc.load_sum / acc.samples as u32,
                samples: acc.samples,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.avg_tokens_per_second
                .total_cmp(&a.avg_tokens_per_second)
                .then_with(|| a.model_key_label.cmp(&b.model_key_label))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn clear(&self, model_key_label: Option<&str>) -> StoreResult<u64> {
        let mut records = self.records.write();
        let before = records.len();
        match model_key_label {
            Some(label) => records.retain(|r| r.model_key_label != label),
            None => records.clear(),
        }
        Ok((before - records.len()) as u64)
    }
}
