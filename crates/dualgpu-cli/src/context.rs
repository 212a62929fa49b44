//! Shared command context: effective configuration plus the factories every
//! command uses to build pools and stores.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use dualgpu_foundation::backend::LauncherRegistry;
use dualgpu_foundation::persistence::SqliteBenchmarkStore;
use dualgpu_foundation::{EnginePool, PoolConfig};
use dualgpu_kernel::{BackendLauncher, BenchmarkStore, MetricsSink};

use crate::config::AppConfig;
use crate::output::OutputFormat;

pub struct CliContext {
    pub config: AppConfig,
    pub output: OutputFormat,
}

impl CliContext {
    pub fn load(config_path: Option<&Path>, output: OutputFormat) -> anyhow::Result<Self> {
        let config = AppConfig::load(config_path).context("failed to load configuration")?;
        config
            .pool
            .validate()
            .context("invalid pool configuration")?;
        Ok(Self { config, output })
    }

    pub async fn open_store(&self) -> anyhow::Result<Arc<dyn BenchmarkStore>> {
        let store = SqliteBenchmarkStore::connect(&self.config.benchmark_db)
            .await
            .with_context(|| format!("failed to open {}", self.config.benchmark_db))?;
        Ok(Arc::new(store))
    }

    pub fn launcher(&self) -> anyhow::Result<Arc<dyn BackendLauncher>> {
        let registry = LauncherRegistry::with_defaults(self.config.launcher.clone())
            .context("failed to set up backend launchers")?;
        Ok(Arc::new(registry))
    }

    pub fn build_pool(
        &self,
        pool_config: PoolConfig,
        store: Option<Arc<dyn BenchmarkStore>>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> anyhow::Result<EnginePool> {
        let mut builder = EnginePool::builder(self.launcher()?).config(pool_config);
        if let Some(store) = store {
            builder = builder.benchmark_store(store);
        }
        if let Some(metrics) = metrics {
            builder = builder.metrics(metrics);
        }
        Ok(builder.build()?)
    }
}
