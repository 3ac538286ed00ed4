//! Server discovery and quick setup.
//!
//! Discovery turns "a host and a login" into declarative server records.
//! [`PortScanDiscovery`] only looks at which well-known ports answer; richer
//! sources (remote command execution, installed software inventories) plug in
//! behind [`ServerDiscovery`].

use async_trait::async_trait;
use futures::future::join_all;
use rand::RngCore;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AppConfig, ConfigError, TlsCamouflageSettings, TransportKind, TunnelConfig};
use crate::probe::{LatencyProbe, ProbeError};

/// File name written by [`quick_setup`].
pub const QUICK_SETUP_FILE: &str = "meshrelay-config.toml";

/// Tag put on records found by port scanning.
pub const DISCOVERED_TAG: &str = "discovered";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Server {target} is unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: ProbeError,
    },

    #[error("Protocol provisioning is not available for this discovery source")]
    ProvisioningUnavailable,

    #[error("Discovery produced no usable server")]
    NothingFound,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Producer of server records.
#[async_trait]
pub trait ServerDiscovery: Send + Sync {
    async fn discover(&self) -> DiscoveryResult<Vec<TunnelConfig>>;

    /// Installs server-side support for `kinds`.
    async fn provision(&self, _kinds: &[TransportKind]) -> DiscoveryResult<()> {
        Err(DiscoveryError::ProvisioningUnavailable)
    }
}

/// Credentials for the ssh login that every discovered host offers.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
}

pub struct PortScanDiscovery {
    host: String,
    ssh_port: u16,
    credentials: Credentials,
    candidates: Vec<(TransportKind, u16)>,
    probe: LatencyProbe,
}

impl PortScanDiscovery {
    pub fn new(host: impl Into<String>, ssh_port: u16, credentials: Credentials) -> Self {
        PortScanDiscovery {
            host: host.into(),
            ssh_port,
            credentials,
            candidates: vec![
                (TransportKind::TlsCamouflage, 443),
                (TransportKind::TlsCamouflage, 8443),
            ],
            probe: LatencyProbe::tcp_only(Duration::from_secs(3)),
        }
    }

    /// Replaces the list of (transport, port) pairs to scan besides ssh.
    pub fn with_candidates(mut self, candidates: Vec<(TransportKind, u16)>) -> Self {
        self.candidates = candidates;
        self
    }

    fn ssh_record(&self) -> TunnelConfig {
        let name = format!("{}-ssh", self.host);
        let mut record = TunnelConfig::new(name, self.host.clone(), self.ssh_port)
            .with_user(self.credentials.user.clone());
        record.password = self.credentials.password.clone();
        record.key_path = self.credentials.key_path.clone();
        record
    }

    fn candidate_record(&self, kind: TransportKind, port: u16, index: usize) -> TunnelConfig {
        let name = format!("{}-{}-{port}", self.host, kind);
        let mut record = TunnelConfig::new(name, self.host.clone(), port)
            .with_transport(kind)
            .with_tags([DISCOVERED_TAG]);
        // Stays disabled until the server side is provisioned.
        record.enabled = false;
        record.priority = 10 + i32::try_from(index).unwrap_or(i32::MAX - 10);
        if kind == TransportKind::TlsCamouflage {
            record.tls_camouflage = Some(TlsCamouflageSettings {
                uuid: random_uuid(),
                ..Default::default()
            });
        }
        record
    }
}

fn random_uuid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

#[async_trait]
impl ServerDiscovery for PortScanDiscovery {
    async fn discover(&self) -> DiscoveryResult<Vec<TunnelConfig>> {
        info!(host = %self.host, port = self.ssh_port, "Starting server discovery");

        self.probe
            .connect_rtt(&self.host, self.ssh_port)
            .await
            .map_err(|source| DiscoveryError::Unreachable {
                target: format!("{}:{}", self.host, self.ssh_port),
                source,
            })?;

        let scans = join_all(self.candidates.iter().map(|(kind, port)| async move {
            let open = self.probe.connect_rtt(&self.host, *port).await.is_ok();
            (*kind, *port, open)
        }))
        .await;

        let mut records = vec![self.ssh_record()];
        for (index, (kind, port, _)) in scans.into_iter().filter(|(_, _, open)| *open).enumerate() {
            info!(host = %self.host, transport = %kind, port, "Found open protocol port");
            records.push(self.candidate_record(kind, port, index));
        }
        Ok(records)
    }
}

/// Options for [`quick_setup`].
#[derive(Debug, Clone)]
pub struct QuickSetupOptions {
    /// Ask the discovery source to provision every discovered transport
    pub provision: bool,
    pub output_dir: PathBuf,
}

/// Runs discovery, optionally provisions, and writes an auto-selecting config.
/// Returns the written path and the config.
pub async fn quick_setup(
    discovery: &dyn ServerDiscovery,
    options: &QuickSetupOptions,
) -> DiscoveryResult<(PathBuf, AppConfig)> {
    let mut servers = discovery.discover().await?;
    if servers.is_empty() {
        return Err(DiscoveryError::NothingFound);
    }

    if options.provision {
        let mut kinds: Vec<TransportKind> = servers
            .iter()
            .map(|s| s.transport)
            .filter(|k| *k != TransportKind::Ssh)
            .collect();
        kinds.sort();
        kinds.dedup();

        if !kinds.is_empty() {
            match discovery.provision(&kinds).await {
                Ok(()) => {
                    for server in servers.iter_mut() {
                        server.enabled = true;
                    }
                    info!(count = kinds.len(), "Provisioned discovered transports");
                }
                Err(e) => warn!(error = %e, "Provisioning failed, continuing with ssh only"),
            }
        }
    }

    let mut config = AppConfig {
        servers,
        auto_select: true,
        ..AppConfig::default()
    };
    config.apply_defaults();
    config.validate()?;

    let path = options.output_dir.join(QUICK_SETUP_FILE);
    config.save(&path)?;
    info!(
        path = %path.display(),
        servers = config.servers.len(),
        "Wrote quick setup configuration"
    );
    Ok((path, config))
}
