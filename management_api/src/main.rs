use anyhow::{Context, Result};
use clap::Parser;
use management_api::{run, RunOptions};
use relay_core::logging::{init_logging, LogOptions, RecentLogs};
use relay_core::AppConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "meshrelay management API server", long_about = None)]
struct Args {
    /// Configuration file (default: the per-user config path)
    #[arg(short, long, env = "MESHRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides api.host
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides api.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level, overrides monitoring.log_level
    #[arg(short, long, env = "MESHRELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "MESHRELAY_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    let logs = config.monitoring.enabled.then(RecentLogs::default);
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitoring.log_level);
    let mut options = LogOptions {
        json_format: args.json_logs,
        log_to_file: config.monitoring.log_dir.is_some(),
        log_dir: config
            .monitoring
            .log_dir
            .clone()
            .unwrap_or_else(|| "./logs".to_string()),
        ..LogOptions::from_level_name(level)
    };
    if let Some(logs) = &logs {
        options = options.with_capture(logs.clone());
    }
    let _guard = init_logging(options);

    run(
        config,
        RunOptions {
            host: args.host,
            port: args.port,
            config_path: Some(path),
            logs,
        },
    )
    .await
}
