//! Client mode, server mode and quick setup.

use management_api::RunOptions;
use relay_core::discovery::{quick_setup, PortScanDiscovery, QuickSetupOptions};
use relay_core::logging::RecentLogs;
use relay_core::tunnel::FailoverSupervisor;
use relay_core::{AppConfig, TunnelOrchestrator};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{CliResult, ConfigArgs, QuickArgs, ServerArgs};
use crate::render;

pub async fn quick(args: QuickArgs) -> CliResult<()> {
    println!("Quick setup: {}@{}:{}", args.user, args.host, args.port);

    let discovery = PortScanDiscovery::new(args.host.clone(), args.port, args.credentials());
    let options = QuickSetupOptions {
        provision: args.setup,
        output_dir: args.output_dir.clone(),
    };
    let (path, config) = quick_setup(&discovery, &options).await?;
    render::quick_setup_done(&path, &config);

    if args.connect {
        run_client(config, None).await?;
    }
    Ok(())
}

pub async fn from_config(args: ConfigArgs, logs: RecentLogs) -> CliResult<()> {
    let config = AppConfig::load(&args.path)?;
    println!("Configuration loaded: {} servers", config.servers.len());

    if args.server {
        serve(config, Some(args.path), None, args.port, logs).await
    } else {
        run_client(config, args.tunnel).await
    }
}

pub async fn server(args: ServerArgs, logs: RecentLogs) -> CliResult<()> {
    let path = args.config.unwrap_or_else(AppConfig::default_path);
    let config = if path.exists() {
        AppConfig::load(&path)?
    } else {
        info!(path = %path.display(), "No configuration file, starting empty");
        AppConfig::default()
    };
    serve(config, Some(path), args.host, args.port, logs).await
}

async fn serve(
    config: AppConfig,
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    logs: RecentLogs,
) -> CliResult<()> {
    let shown_host = host.clone().unwrap_or_else(|| config.api.host.clone());
    let shown_port = port.unwrap_or(config.api.port);
    render::server_banner(&shown_host, shown_port, &config);

    let logs = config.monitoring.enabled.then_some(logs);
    management_api::run(
        config,
        RunOptions {
            host,
            port,
            config_path,
            logs,
        },
    )
    .await?;
    Ok(())
}

/// Starts `tunnel` (or the auto-selected one), prints every state change and
/// waits for ctrl-c. All tunnels are stopped before returning.
pub async fn run_client(mut config: AppConfig, tunnel: Option<String>) -> CliResult<()> {
    if tunnel.is_some() {
        config.auto_select = false;
    }
    let orchestrator = TunnelOrchestrator::from_config(&config);
    let mut events = orchestrator.subscribe();

    let started = match tunnel {
        Some(name) => {
            orchestrator.start().await?;
            orchestrator.start_tunnel(&name)?;
            Some(name)
        }
        None => orchestrator.start().await?,
    };
    let Some(started) = started else {
        println!("auto_select is off and no tunnel was named; use --tunnel <name>");
        orchestrator.shutdown().await?;
        return Ok(());
    };
    println!("Starting tunnel '{started}', press ctrl-c to stop");

    let scope = CancellationToken::new();
    let supervisor = config.enable_failover.then(|| {
        FailoverSupervisor::new(orchestrator.clone(), config.failover_timeout())
            .spawn(scope.clone())
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => render::tunnel_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed tunnel events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("Shutting down...");
    scope.cancel();
    if let Some(supervisor) = supervisor {
        if let Err(e) = supervisor.await {
            warn!(error = %e, "Failover supervisor ended abnormally");
        }
    }

    let stopped = orchestrator.shutdown().await;
    render::tunnel_table(&orchestrator.status());
    stopped?;
    Ok(())
}
