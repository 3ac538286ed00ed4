use relay_core::logging::RecentLogs;
use relay_core::{AppConfig, TunnelOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub(crate) orchestrator: TunnelOrchestrator,
    /// Settings besides the server list, which lives in the orchestrator
    config: Arc<AppConfig>,
    config_path: Option<Arc<PathBuf>>,
    pub(crate) logs: Option<RecentLogs>,
    pub(crate) started_at: Instant,
}

impl ApiState {
    pub fn new(config: AppConfig, orchestrator: TunnelOrchestrator) -> Self {
        ApiState {
            orchestrator,
            config: Arc::new(config),
            config_path: None,
            logs: None,
            started_at: Instant::now(),
        }
    }

    /// Server changes made through the API are written back to `path`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(Arc::new(path.into()));
        self
    }

    pub fn with_logs(mut self, logs: RecentLogs) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Configuration as loaded at startup.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &TunnelOrchestrator {
        &self.orchestrator
    }

    /// Current configuration with the orchestrator's server list.
    pub fn current_config(&self) -> AppConfig {
        let mut config = AppConfig::clone(&self.config);
        config.servers = self.orchestrator.tunnels();
        config
    }

    /// Writes the current configuration back to disk, if it came from a file.
    pub(crate) fn persist(&self) {
        let Some(path) = self.config_path.as_deref() else {
            return;
        };
        match self.current_config().save(path) {
            Ok(()) => debug!(path = %path.display(), "Saved configuration"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not save configuration"),
        }
    }
}
