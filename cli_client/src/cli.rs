//! Command line definition and dispatch for the meshrelay client.

use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_core::discovery::{Credentials, DiscoveryError};
use relay_core::logging::RecentLogs;
use relay_core::{ConfigError, MeshError, TunnelError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::{client, interactive, mesh};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

const EXAMPLES: &str = "Examples:
  meshrelay quick 203.0.113.7 root mypassword
  meshrelay quick 203.0.113.7 ubuntu ~/.ssh/id_ed25519 --setup
  meshrelay mesh init 10.99.0.0/24
  meshrelay mesh add 203.0.113.7 root --region eu
  meshrelay config client-configs/meshrelay-config.toml --server --port 9999";

/// meshrelay: latency-aware relay tunnels and a small mesh overlay
#[derive(Parser, Debug)]
#[command(
    name = "meshrelay",
    author,
    version,
    about,
    long_about = None,
    after_help = EXAMPLES
)]
pub struct Cli {
    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "MESHRELAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: LogLevelArg,

    /// Emit JSON logs
    #[arg(long, env = "MESHRELAY_JSON_LOGS", global = true)]
    pub json_logs: bool,

    /// Runs the interactive menu when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Menu driven setup
    #[command(visible_aliases = ["menu", "i"])]
    Interactive,
    /// Discover a server and write a ready to use configuration
    #[command(visible_alias = "q")]
    Quick(QuickArgs),
    /// Manage the mesh overlay
    #[command(visible_alias = "m")]
    Mesh(MeshArgs),
    /// Run tunnels from a configuration file
    #[command(visible_alias = "c")]
    Config(ConfigArgs),
    /// Run the management API
    #[command(visible_alias = "s")]
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct QuickArgs {
    pub host: String,

    pub user: String,

    /// Password, or a private key path when it starts with '/' or '~'
    pub auth: Option<String>,

    /// Private key path, takes precedence over AUTH
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// SSH port of the server
    #[arg(short = 'P', long, default_value_t = 22)]
    pub port: u16,

    /// Provision every discovered protocol on the server
    #[arg(short, long)]
    pub setup: bool,

    /// Where the generated configuration is written
    #[arg(short, long, default_value = "client-configs")]
    pub output_dir: PathBuf,

    /// Start client mode with the generated configuration
    #[arg(long)]
    pub connect: bool,
}

impl QuickArgs {
    pub fn credentials(&self) -> Credentials {
        let mut credentials = Credentials {
            user: self.user.clone(),
            ..Default::default()
        };

        if let Some(key) = &self.key {
            credentials.key_path = Some(expand_home(&key.display().to_string()));
        } else if let Some(auth) = &self.auth {
            if looks_like_path(auth) {
                credentials.key_path = Some(expand_home(auth));
            } else {
                credentials.password = Some(auth.clone());
            }
        }
        credentials
    }
}

fn looks_like_path(value: &str) -> bool {
    value.starts_with('/') || value.starts_with('~')
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct MeshArgs {
    /// Mesh state file (default: mesh-state.json in the config directory)
    #[arg(long, env = "MESHRELAY_MESH_STATE", global = true)]
    pub state: Option<PathBuf>,

    /// Configuration file whose [mesh] section seeds `init`
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: MeshCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MeshCommand {
    /// Create the local node and persist the mesh state
    Init {
        /// Address block, e.g. 10.99.0.0/24
        block: Option<String>,
    },
    /// Register a remote server
    Add {
        host: String,
        user: String,
        password: Option<String>,
        #[arg(short = 'P', long, default_value_t = 22)]
        port: u16,
        #[arg(short, long)]
        name: Option<String>,
        /// Comma separated tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(short, long)]
        region: Option<String>,
    },
    /// Show nodes and routes
    Status {
        /// Probe every node before printing
        #[arg(long)]
        check: bool,
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect to a node, the best one when no target is given
    Connect {
        node: Option<String>,
        #[arg(long, conflicts_with_all = ["node", "tag"])]
        region: Option<String>,
        #[arg(long, conflicts_with = "node")]
        tag: Option<String>,
    },
    /// Remove a remote node
    Remove { node: String },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ConfigArgs {
    pub path: PathBuf,

    /// Serve the management API instead of client mode
    #[arg(short, long)]
    pub server: bool,

    /// API port, overrides api.port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Start this tunnel instead of auto-selecting one
    #[arg(short, long)]
    pub tunnel: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServerArgs {
    /// API port, overrides api.port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// API listen address, overrides api.host
    #[arg(long)]
    pub host: Option<String>,

    /// Configuration file; a missing file starts with an empty configuration
    #[arg(short, long, env = "MESHRELAY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("No mesh state at {0}, run `meshrelay mesh init` first")]
    MeshMissing(PathBuf),

    #[error("Mesh state already exists at {0}")]
    MeshExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0:#}")]
    Server(#[from] anyhow::Error),
}

pub type CliResult<T> = Result<T, CliError>;

/// Runs the selected command. `logs` is the capture installed by logging
/// setup, served by the API when monitoring is enabled.
pub async fn run(cli: Cli, logs: RecentLogs) -> CliResult<()> {
    let command = match cli.command.unwrap_or(Command::Interactive) {
        Command::Interactive => match interactive::run_stdio()? {
            Some(command) => command,
            None => return Ok(()),
        },
        command => command,
    };

    match command {
        Command::Quick(args) => client::quick(args).await,
        Command::Mesh(args) => mesh::run(args).await,
        Command::Config(args) => client::from_config(args, logs).await,
        Command::Server(args) => client::server(args, logs).await,
        // The menu never selects itself
        Command::Interactive => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_interactive() {
        let cli = Cli::try_parse_from(["meshrelay"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, LogLevelArg::Warn);
    }

    #[test]
    fn test_aliases() {
        let cli = Cli::try_parse_from(["meshrelay", "m", "status"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Mesh(MeshArgs {
                action: MeshCommand::Status { check: false, json: false },
                ..
            }))
        ));

        let cli = Cli::try_parse_from(["meshrelay", "menu"]).unwrap();
        assert_eq!(cli.command, Some(Command::Interactive));
    }

    #[test]
    fn test_mesh_add_arguments() {
        let cli = Cli::try_parse_from([
            "meshrelay", "mesh", "add", "203.0.113.7", "root", "pw", "--tags", "edge,fast",
            "--region", "eu", "-P", "2222", "--state", "/tmp/mesh.json",
        ])
        .unwrap();

        let Some(Command::Mesh(args)) = cli.command else {
            panic!("expected mesh command");
        };
        assert_eq!(args.state, Some(PathBuf::from("/tmp/mesh.json")));
        assert_eq!(
            args.action,
            MeshCommand::Add {
                host: "203.0.113.7".into(),
                user: "root".into(),
                password: Some("pw".into()),
                port: 2222,
                name: None,
                tags: vec!["edge".into(), "fast".into()],
                region: Some("eu".into()),
            }
        );
    }

    #[test]
    fn test_connect_targets_conflict() {
        let both = ["meshrelay", "mesh", "connect", "abc", "--region", "eu"];
        assert!(Cli::try_parse_from(both).is_err());
        assert!(Cli::try_parse_from(["meshrelay", "mesh", "connect", "--tag", "edge"]).is_ok());
    }

    #[test]
    fn test_config_flags() {
        let args = ["meshrelay", "config", "relay.toml", "--server", "--port", "9999"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Config(ConfigArgs {
                path: PathBuf::from("relay.toml"),
                server: true,
                port: Some(9999),
                tunnel: None,
            }))
        );
    }

    #[test]
    fn test_global_log_flags_after_subcommand() {
        let args = ["meshrelay", "server", "--log-level", "debug", "--json-logs"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.log_level, LogLevelArg::Debug);
        assert!(cli.json_logs);
        assert_eq!(tracing::Level::from(cli.log_level), tracing::Level::DEBUG);
    }

    fn quick(auth: Option<&str>, key: Option<&str>) -> QuickArgs {
        QuickArgs {
            host: "203.0.113.7".into(),
            user: "root".into(),
            auth: auth.map(Into::into),
            key: key.map(PathBuf::from),
            port: 22,
            setup: false,
            output_dir: PathBuf::from("client-configs"),
            connect: false,
        }
    }

    #[test]
    fn test_quick_credentials() {
        let credentials = quick(Some("secret"), None).credentials();
        assert_eq!(credentials.password.as_deref(), Some("secret"));
        assert!(credentials.key_path.is_none());

        let credentials = quick(Some("/keys/id_ed25519"), None).credentials();
        assert_eq!(credentials.key_path.as_deref(), Some("/keys/id_ed25519"));
        assert!(credentials.password.is_none());

        let credentials = quick(Some("secret"), Some("relative/key")).credentials();
        assert_eq!(credentials.key_path.as_deref(), Some("relative/key"));
        assert!(credentials.password.is_none());

        let credentials = quick(None, None).credentials();
        assert_eq!(credentials.user, "root");
        assert!(credentials.password.is_none() && credentials.key_path.is_none());
    }

    #[test]
    fn test_home_expansion() {
        let expanded = expand_home("~/.ssh/id_rsa");
        if dirs::home_dir().is_some() {
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with(".ssh/id_rsa"));
        }
        assert_eq!(expand_home("/abs/key"), "/abs/key");
    }
}
