//! API server

use anyhow::Context;
use relay_core::logging::RecentLogs;
use relay_core::tunnel::FailoverSupervisor;
use relay_core::{AppConfig, TunnelOrchestrator};
use std::io;
use std::path::PathBuf;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::ApiState;

/// Binds `addr` and serves until `scope` is cancelled.
pub async fn serve<A: ToSocketAddrs>(
    state: ApiState,
    addr: A,
    scope: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(state, listener, scope).await
}

/// Serves on an already bound listener until `scope` is cancelled.
pub async fn serve_listener(
    state: ApiState,
    listener: TcpListener,
    scope: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Management API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { scope.cancelled().await })
        .await?;

    info!("Management API stopped");
    Ok(())
}

/// Options for [`run`] that do not come from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Where server changes made through the API are saved
    pub config_path: Option<PathBuf>,
    pub logs: Option<RecentLogs>,
}

/// Starts the orchestrator (and failover when enabled), then serves the API
/// until ctrl-c. Every tunnel is stopped before returning.
pub async fn run(config: AppConfig, options: RunOptions) -> anyhow::Result<()> {
    let orchestrator = TunnelOrchestrator::from_config(&config);
    match orchestrator.start().await {
        Ok(Some(name)) => info!(tunnel = %name, "Started tunnel"),
        Ok(None) => info!("Auto-select is off, waiting for API requests"),
        Err(e) => warn!(error = %e, "Could not start a tunnel, serving the API anyway"),
    }

    let scope = CancellationToken::new();
    if config.enable_failover {
        FailoverSupervisor::new(orchestrator.clone(), config.failover_timeout())
            .spawn(scope.clone());
    }

    let ctrl_c_scope = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        ctrl_c_scope.cancel();
    });

    let host = options.host.unwrap_or_else(|| config.api.host.clone());
    let port = options.port.unwrap_or(config.api.port);

    let mut state = ApiState::new(config, orchestrator.clone());
    if let Some(path) = options.config_path {
        state = state.with_config_path(path);
    }
    if let Some(logs) = options.logs {
        state = state.with_logs(logs);
    }

    let served = serve(state, (host.as_str(), port), scope.clone())
        .await
        .with_context(|| format!("management API on {host}:{port} failed"));

    scope.cancel();
    if let Err(e) = orchestrator.shutdown().await {
        warn!(error = %e, "Errors while stopping tunnels");
    }
    served
}
