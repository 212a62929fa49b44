//! Benchmark history contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// One load/throughput sample. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub model_key_label: String,
    pub load_duration: Duration,
    pub first_token_latency: Duration,
    pub tokens_per_second: f64,
    pub recorded_at: DateTime<Utc>,
}

impl BenchmarkRecord {
    pub fn new(
        model_key_label: impl Into<String>,
        load_duration: Duration,
        first_token_latency: Duration,
        tokens_per_second: f64,
    ) -> Self {
        Self {
            model_key_label: model_key_label.into(),
            load_duration,
            first_token_latency,
            tokens_per_second,
            recorded_at: Utc::now(),
        }
    }
}

/// Aggregate throughput for one model label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub model_key_label: String,
    pub avg_tokens_per_second: f64,
    pub best_tokens_per_second: f64,
    pub avg_load_duration: Duration,
    pub samples: u64,
}

/// Durable append-only log of benchmark records.
///
/// Implementations must be safe under concurrent `record` calls from
/// multiple pool tasks.
#[async_trait]
pub trait BenchmarkStore: Send + Sync {
    async fn record(&self, record: &BenchmarkRecord) -> StoreResult<()>;

    /// Most recent records for a label, newest first.
    async fn query_recent(
        &self,
        model_key_label: &str,
        limit: usize,
    ) -> StoreResult<Vec<BenchmarkRecord>>;

    /// Labels ranked by average tokens per second, fastest first.
    async fn fastest_models(&self, limit: usize) -> StoreResult<Vec<ModelPerformance>>;

    /// Delete records for one label, or all records. Returns rows removed.
    async fn clear(&self, model_key_label: Option<&str>) -> StoreResult<u64>;
}
