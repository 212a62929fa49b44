//! `dualgpu run` command implementation

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, bail};
use colored::Colorize;
use dualgpu_kernel::{BenchmarkRecord, BenchmarkStore, GenerationParams, ModelKey};
use serde::Serialize;
use tracing::warn;

use crate::context::CliContext;
use crate::output::{OutputFormat, json};

/// Parse repeated `key=value` flags.
pub fn parse_params(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("parameter '{item}' is not in key=value form");
        };
        if key.trim().is_empty() {
            bail!("parameter '{item}' has an empty key");
        }
        params.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(params)
}

#[derive(Debug, Serialize)]
struct RunReport {
    model: String,
    load_ms: u64,
    first_token_ms: u64,
    total_ms: u64,
    tokens: u32,
    tokens_per_second: f64,
    text: String,
}

/// Execute the `dualgpu run` command
pub async fn run(
    ctx: &CliContext,
    model: &str,
    backend: &str,
    raw_params: &[String],
    prompt: &str,
    max_tokens: u32,
) -> anyhow::Result<()> {
    let params = parse_params(raw_params)?;
    let key = ModelKey::parse(model, backend, &params)?;

    let store = match ctx.open_store().await {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(error = %err, "Benchmark store unavailable; this run will not be recorded");
            None
        }
    };

    // The generation below is the benchmark for this run.
    let pool_config = ctx.config.pool.clone().with_warmup_benchmark(false);
    let pool = ctx.build_pool(pool_config, None, None)?;

    if ctx.output == OutputFormat::Text {
        println!("{} Loading {}", "→".green(), key.label().cyan());
    }

    let started = Instant::now();
    let result = async {
        let engine = pool
            .get(&key)
            .await
            .with_context(|| format!("failed to load {}", key.label()))?;
        let load_duration = started.elapsed();
        let generation = engine
            .generate(prompt, &GenerationParams::default().with_max_tokens(max_tokens))
            .await?;
        anyhow::Ok((load_duration, generation))
    }
    .await;
    pool.shutdown().await;
    let (load_duration, generation) = result?;

    if let Some(store) = store {
        let record = BenchmarkRecord::new(
            key.label(),
            load_duration,
            generation.first_token_latency,
            generation.tokens_per_second(),
        );
        if let Err(err) = store.record(&record).await {
            warn!(error = %err, "Failed to record benchmark");
        }
    }

    let report = RunReport {
        model: key.label(),
        load_ms: load_duration.as_millis() as u64,
        first_token_ms: generation.first_token_latency.as_millis() as u64,
        total_ms: generation.total_duration.as_millis() as u64,
        tokens: generation.tokens,
        tokens_per_second: generation.tokens_per_second(),
        text: generation.text,
    };

    match ctx.output {
        OutputFormat::Json => println!("{}", json::pretty(&serde_json::to_value(&report)?)),
        _ => {
            println!("{}", report.text);
            println!();
            println!(
                "  load {} ms, first token {} ms, {} tokens in {} ms ({:.1} tok/s)",
                report.load_ms,
                report.first_token_ms,
                report.tokens,
                report.total_ms,
                report.tokens_per_second
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = parse_params(&[
            "n_gpu_layers=35".to_string(),
            " split_mode = row ".to_string(),
            "tag=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(params["n_gpu_layers"], "35");
        assert_eq!(params["split_mode"], "row");
        assert_eq!(params["tag"], "a=b");
    }

    #[test]
    fn test_parse_params_rejects_malformed() {
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=1".to_string()]).is_err());
    }
}
