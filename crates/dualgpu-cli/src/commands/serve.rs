//! `dualgpu serve` command implementation

use std::sync::Arc;

use colored::Colorize;
use dualgpu_foundation::EnginePool;
use dualgpu_foundation::engine_pool::{AlertLevel, PoolEvent};
use dualgpu_kernel::{MetricsSink, ModelKey};
use dualgpu_monitoring::{AppState, MetricsServer, MetricsServerConfig, PrometheusMetricsSink};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PreloadModel;
use crate::context::CliContext;

/// Execute the `dualgpu serve` command
pub async fn run(ctx: &CliContext) -> anyhow::Result<()> {
    let store = ctx.open_store().await?;
    let sink = match ctx.config.metrics_port {
        Some(_) => Some(Arc::new(PrometheusMetricsSink::new()?)),
        None => None,
    };
    let metrics = sink.clone().map(|s| s as Arc<dyn MetricsSink>);
    let pool = ctx.build_pool(ctx.config.pool.clone(), Some(store), metrics)?;

    let alerts = spawn_event_logger(pool.subscribe());
    pool.start();

    let stop = Arc::new(Notify::new());
    let server = ctx.config.metrics_port.map(|port| {
        let server = MetricsServer::new(
            MetricsServerConfig::default().with_port(port),
            AppState::new(pool.clone(), sink.clone()),
        );
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if let Err(err) = server.serve(async move { stop.notified().await }).await {
                error!(error = %err, "Status server failed");
            }
        })
    });

    println!(
        "{} Engine pool running (capacity {}, sweep every {}s)",
        "✓".green(),
        pool.capacity(),
        pool.config().sweep_interval_secs
    );
    if let Some(port) = ctx.config.metrics_port {
        println!("  Metrics: http://0.0.0.0:{port}/metrics");
    }

    preload(&pool, &ctx.config.preload).await;

    println!("  Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    println!("{} Shutting down", "→".yellow());
    stop.notify_one();
    pool.shutdown().await;
    if let Some(server) = server {
        let _ = server.await;
    }
    alerts.abort();

    let stats = pool.stats();
    println!(
        "  {} hits, {} misses ({:.1}% hit rate), {} loads, {} evictions",
        stats.hits, stats.misses, stats.hit_rate, stats.total_loads, stats.evictions
    );
    Ok(())
}

/// Load configured models in order. Failures are reported and skipped.
async fn preload(pool: &EnginePool, models: &[PreloadModel]) {
    for model in models {
        let key = match ModelKey::parse(&model.model_path, &model.backend, &model.parameters) {
            Ok(key) => key,
            Err(err) => {
                warn!(model = %model.model_path, error = %err, "Skipping invalid preload entry");
                continue;
            }
        };
        match pool.get(&key).await {
            Ok(_) => println!("  {} Preloaded {}", "✓".green(), key.label().cyan()),
            Err(err) => println!("  {} {}: {}", "✗".red(), key.label(), err),
        }
    }
}

fn spawn_event_logger(mut events: broadcast::Receiver<PoolEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Alert { level, message }) => match level {
                    AlertLevel::Critical => eprintln!("{} {}", "CRITICAL".red().bold(), message),
                    _ => eprintln!("{} {}", "WARNING".yellow(), message),
                },
                Ok(PoolEvent::ReloadScheduled { label }) => {
                    info!(model = %label, "Reloading engine after health failure");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
