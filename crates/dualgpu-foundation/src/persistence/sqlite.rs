//! SQLite benchmark store
//!
//! Opened in WAL mode with a busy timeout, so several pool tasks can record
//! through the connection pool at once.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dualgpu_kernel::{BenchmarkRecord, BenchmarkStore, ModelPerformance, StoreError, StoreResult};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteBenchmarkStore {
    pool: SqlitePool,
}

impl SqliteBenchmarkStore {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite:benchmarks.db`.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 5).await
    }

    pub async fn connect_with_options(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        debug!(database_url, "Benchmark store opened");
        Ok(store)
    }

    /// Private in-memory database. One connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn shared(database_url: &str) -> StoreResult<Arc<Self>> {
        Ok(Arc::new(Self::connect(database_url).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current journal mode as reported by SQLite.
    pub async fn journal_mode(&self) -> StoreResult<String> {
        let row = sqlx::query("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.try_get::<String, _>(0)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS benchmarks (
                model_key_label TEXT NOT NULL,
                load_duration_ms INTEGER NOT NULL,
                first_token_latency_ms INTEGER NOT NULL,
                tokens_per_second REAL NOT NULL,
                recorded_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_benchmarks_label_time ON benchmarks(model_key_label, recorded_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    fn parse_record_row(row: &SqliteRow) -> StoreResult<BenchmarkRecord> {
        let model_key_label: String = row
            .try_get("model_key_label")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let load_ms: i64 = row
            .try_get("load_duration_ms")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let first_token_ms: i64 = row
            .try_get("first_token_latency_ms")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let tokens_per_second: f64 = row
            .try_get("tokens_per_second")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let recorded_at_str: String = row
            .try_get("recorded_at")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc);

        Ok(BenchmarkRecord {
            model_key_label,
            load_duration: millis(load_ms),
            first_token_latency: millis(first_token_ms),
            tokens_per_second,
            recorded_at,
        })
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl BenchmarkStore for SqliteBenchmarkStore {
    async fn record(&self, record: &BenchmarkRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO benchmarks
                (model_key_label, load_duration_ms, first_token_latency_ms, tokens_per_second, recorded_at)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(&record.model_key_label)
        .bind(record.load_duration.as_millis() as i64)
        .bind(record.first_token_latency.as_millis() as i64)
        .bind(record.tokens_per_second)
        // Fixed-width UTC so text order matches time order.
        .bind(record.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn query_recent(
        &self,
        model_key_label: &str,
        limit: usize,
    ) -> StoreResult<Vec<BenchmarkRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT model_key_label, load_duration_ms, first_token_latency_ms, tokens_per_second, recorded_at
            FROM benchmarks
            WHERE model_key_label = ?
            ORDER BY recorded_at DESC, rowid DESC
            LIMIT ?
        "#,
        )
        .bind(model_key_label)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_record_row).collect()
    }

    async fn fastest_models(&self, limit: usize) -> StoreResult<Vec<ModelPerformance>> {
        let rows = sqlx::query(
            r#"
            SELECT model_key_label,
                   AVG(tokens_per_second) AS avg_tps,
                   MAX(tokens_per_second) AS best_tps,
                   AVG(load_duration_ms) AS avg_load_ms,
                   COUNT(*) AS samples
            FROM benchmarks
            GROUP BY model_key_label
            ORDER BY avg_tps DESC, model_key_label ASC
            LIMIT ?
        "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let avg_load_ms: f64 = row
                    .try_get("avg_load_ms")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                let samples: i64 = row
                    .try_get("samples")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(ModelPerformance {
                    model_key_label: row
                        .try_get("model_key_label")
                        .map_err(|e| StoreError::Query(e.to_string()))?,
                    avg_tokens_per_second: row
                        .try_get("avg_tps")
                        .map_err(|e| StoreError::Query(e.to_string()))?,
                    best_tokens_per_second: row
                        .try_get("best_tps")
                        .map_err(|e| StoreError::Query(e.to_string()))?,
                    avg_load_duration: Duration::from_secs_f64(avg_load_ms.max(0.0) / 1000.0),
                    samples: samples.max(0) as u64,
                })
            })
            .collect()
    }

    async fn clear(&self, model_key_label: Option<&str>) -> StoreResult<u64> {
        let result = match model_key_label {
            Some(label) => {
                sqlx::query("DELETE FROM benchmarks WHERE model_key_label = ?")
                    .bind(label)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM benchmarks").execute(&self.pool).await,
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: &str, tps: f64) -> BenchmarkRecord {
        BenchmarkRecord::new(
            label,
            Duration::from_millis(1200),
            Duration::from_millis(35),
            tps,
        )
    }

    #[tokio::test]
    async fn test_record_and_query_recent() {
        let store = SqliteBenchmarkStore::in_memory().await.unwrap();
        store.record(&record("m1@mock", 10.0)).await.unwrap();
        store.record(&record("m1@mock", 12.0)).await.unwrap();
        store.record(&record("m2@mock", 5.0)).await.unwrap();

        let recent = store.query_recent("m1@mock", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tokens_per_second, 12.0);
        assert_eq!(recent[0].load_duration, Duration::from_millis(1200));
        assert_eq!(recent[0].first_token_latency, Duration::from_millis(35));
        assert!(recent[0].recorded_at >= recent[1].recorded_at);
    }

    #[tokio::test]
    async fn test_fastest_and_clear() {
        let store = SqliteBenchmarkStore::in_memory().await.unwrap();
        store.record(&record("slow", 4.0)).await.unwrap();
        store.record(&record("fast", 30.0)).await.unwrap();
        store.record(&record("fast", 10.0)).await.unwrap();

        let ranked = store.fastest_models(5).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].model_key_label, "fast");
        assert_eq!(ranked[0].avg_tokens_per_second, 20.0);
        assert_eq!(ranked[0].best_tokens_per_second, 30.0);
        assert_eq!(ranked[0].samples, 2);

        assert_eq!(store.clear(Some("fast")).await.unwrap(), 2);
        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert!(store.fastest_models(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("bench.db").display());
        let store = SqliteBenchmarkStore::connect(&url).await.unwrap();
        assert_eq!(store.journal_mode().await.unwrap().to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("bench.db").display());
        let store = SqliteBenchmarkStore::shared(&url).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.record(&record("m@mock", i as f64)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.query_recent("m@mock", 100).await.unwrap().len(), 16);
    }
}
