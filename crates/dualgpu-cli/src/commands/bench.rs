//! `dualgpu bench` command implementation

use colored::Colorize;
use dualgpu_kernel::{BenchmarkRecord, BenchmarkStore, ModelPerformance};
use serde::Serialize;

use crate::context::CliContext;
use crate::output::render;

#[derive(Debug, Clone, Serialize)]
struct RecordRow {
    recorded_at: String,
    load_ms: u64,
    first_token_ms: u64,
    tokens_per_second: String,
}

impl From<&BenchmarkRecord> for RecordRow {
    fn from(record: &BenchmarkRecord) -> Self {
        Self {
            recorded_at: record.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            load_ms: record.load_duration.as_millis() as u64,
            first_token_ms: record.first_token_latency.as_millis() as u64,
            tokens_per_second: format!("{:.1}", record.tokens_per_second),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RankRow {
    rank: usize,
    model: String,
    avg_tokens_per_second: String,
    best_tokens_per_second: String,
    avg_load_s: String,
    samples: u64,
}

fn rank_rows(ranked: &[ModelPerformance]) -> Vec<RankRow> {
    ranked
        .iter()
        .enumerate()
        .map(|(i, perf)| RankRow {
            rank: i + 1,
            model: perf.model_key_label.clone(),
            avg_tokens_per_second: format!("{:.1}", perf.avg_tokens_per_second),
            best_tokens_per_second: format!("{:.1}", perf.best_tokens_per_second),
            avg_load_s: format!("{:.2}", perf.avg_load_duration.as_secs_f64()),
            samples: perf.samples,
        })
        .collect()
}

/// Execute `dualgpu bench recent`
pub async fn recent(ctx: &CliContext, label: &str, limit: usize) -> anyhow::Result<()> {
    let store = ctx.open_store().await?;
    let rows: Vec<RecordRow> = store
        .query_recent(label, limit)
        .await?
        .iter()
        .map(RecordRow::from)
        .collect();

    if rows.is_empty() {
        println!("  No benchmarks recorded for {}.", label.cyan());
        return Ok(());
    }

    println!(
        "{}",
        render(&rows, ctx.output, |row| format!(
            "{}  load {} ms  first token {} ms  {} tok/s",
            row.recorded_at, row.load_ms, row.first_token_ms, row.tokens_per_second
        ))
    );
    Ok(())
}

/// Execute `dualgpu bench fastest`
pub async fn fastest(ctx: &CliContext, limit: usize) -> anyhow::Result<()> {
    let store = ctx.open_store().await?;
    let rows = rank_rows(&store.fastest_models(limit).await?);

    if rows.is_empty() {
        println!("  No benchmarks recorded yet.");
        return Ok(());
    }

    println!(
        "{}",
        render(&rows, ctx.output, |row| format!(
            "{:>2}. {}  {} tok/s avg, {} best, load {} s ({} runs)",
            row.rank,
            row.model.cyan(),
            row.avg_tokens_per_second,
            row.best_tokens_per_second,
            row.avg_load_s,
            row.samples
        ))
    );
    Ok(())
}

/// Execute `dualgpu bench clear`
pub async fn clear(ctx: &CliContext, label: Option<&str>) -> anyhow::Result<()> {
    let store = ctx.open_store().await?;
    let deleted = store.clear(label).await?;
    match label {
        Some(label) => println!(
            "{} Deleted {} records for {}",
            "✓".green(),
            deleted,
            label.cyan()
        ),
        None => println!("{} Deleted {} records", "✓".green(), deleted),
    }
    Ok(())
}
