mod cli;
mod client;
mod interactive;
mod mesh;
mod render;

use clap::Parser;
use relay_core::logging::{init_logging, Console, LogOptions, RecentLogs};
use tracing::debug;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let logs = RecentLogs::default();
    let guard = init_logging(LogOptions {
        level: cli.log_level.into(),
        console: Console::Stderr,
        json_format: cli.json_logs,
        capture: Some(logs.clone()),
        ..Default::default()
    });
    debug!(version = env!("CARGO_PKG_VERSION"), "Starting meshrelay");

    let code = match cli::run(cli, logs).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };

    // Flush file logs before exiting
    drop(guard);
    std::process::exit(code);
}
