//! Backend launchers.
//!
//! [`LauncherRegistry`] routes each [`ModelKey`] to the launcher registered
//! for its [`BackendKind`], so the pool only ever sees one
//! [`BackendLauncher`].

mod mock;
mod server;

pub use mock::{MockBackend, MockLauncher};
pub use server::{ServerCommand, ServerHandle, ServerLauncher, ServerLauncherConfig, default_port};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dualgpu_kernel::{
    BackendError, BackendHandle, BackendKind, BackendLauncher, BackendResult, ModelKey,
};

/// Dispatches loads by backend kind.
#[derive(Clone, Default)]
pub struct LauncherRegistry {
    launchers: HashMap<BackendKind, Arc<dyn BackendLauncher>>,
}

impl LauncherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock launcher plus one [`ServerLauncher`] shared by the three real
    /// backend kinds.
    pub fn with_defaults(config: ServerLauncherConfig) -> BackendResult<Self> {
        let server: Arc<dyn BackendLauncher> = Arc::new(ServerLauncher::new(config)?);
        Ok(Self::new()
            .with_launcher(BackendKind::Mock, Arc::new(MockLauncher::new()))
            .with_launcher(BackendKind::LlamaCpp, Arc::clone(&server))
            .with_launcher(BackendKind::Vllm, Arc::clone(&server))
            .with_launcher(BackendKind::Transformers, server))
    }

    pub fn with_launcher(mut self, kind: BackendKind, launcher: Arc<dyn BackendLauncher>) -> Self {
        self.launchers.insert(kind, launcher);
        self
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.launchers.contains_key(&kind)
    }
}

#[async_trait]
impl BackendLauncher for LauncherRegistry {
    async fn load(
        &self,
        key: &ModelKey,
        timeout: Option<Duration>,
    ) -> BackendResult<Arc<dyn BackendHandle>> {
        let launcher = self.launchers.get(&key.backend_kind()).ok_or_else(|| {
            BackendError::Unsupported(format!(
                "no launcher registered for backend '{}'",
                key.backend_kind()
            ))
        })?;
        launcher.load(key, timeout).await
    }
}
