//! Mesh data model.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::{ConfigError, TransportKind, TunnelConfig};

fn default_address_block() -> String {
    "10.99.0.0/24".to_string()
}

fn default_local_node_name() -> String {
    "local-node".to_string()
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_load_balancing() -> String {
    "latency".to_string()
}

fn default_failover_timeout() -> u64 {
    30
}

fn default_encryption() -> bool {
    true
}

fn default_interface_name() -> String {
    "mesh0".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_route_refresh() -> u64 {
    60
}

fn default_load_refresh() -> u64 {
    60
}

fn default_discovery_interval() -> u64 {
    300
}

/// Overlay settings. Treated as immutable once the overlay is initialized.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MeshConfig {
    /// CIDR the virtual addresses are drawn from
    #[serde(default = "default_address_block")]
    pub address_block: String,

    #[serde(default = "default_local_node_name")]
    pub local_node_name: String,

    #[serde(default)]
    pub auto_discovery: bool,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// round-robin | least-connections | latency
    #[serde(default = "default_load_balancing")]
    pub load_balancing: String,

    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_secs: u64,

    #[serde(default = "default_encryption")]
    pub encryption: bool,

    /// Tags given to nodes added without their own
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_route_refresh")]
    pub route_refresh_secs: u64,

    #[serde(default = "default_load_refresh")]
    pub load_refresh_secs: u64,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            address_block: default_address_block(),
            local_node_name: default_local_node_name(),
            auto_discovery: false,
            health_check_interval_secs: default_health_check_interval(),
            load_balancing: default_load_balancing(),
            failover_timeout_secs: default_failover_timeout(),
            encryption: default_encryption(),
            tags: Vec::new(),
            regions: Vec::new(),
            interface_name: default_interface_name(),
            probe_timeout_secs: default_probe_timeout(),
            route_refresh_secs: default_route_refresh(),
            load_refresh_secs: default_load_refresh(),
            discovery_interval_secs: default_discovery_interval(),
        }
    }
}

impl MeshConfig {
    pub fn with_address_block(mut self, block: impl Into<String>) -> Self {
        self.address_block = block.into();
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn route_refresh(&self) -> Duration {
        Duration::from_secs(self.route_refresh_secs)
    }

    pub fn load_refresh(&self) -> Duration {
        Duration::from_secs(self.load_refresh_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.address_block.parse::<Ipv4Net>() {
            return Err(ConfigError::InvalidValue {
                key: "mesh.address_block".to_string(),
                message: e.to_string(),
            });
        }

        let intervals = [
            ("mesh.health_check_interval_secs", self.health_check_interval_secs),
            ("mesh.probe_timeout_secs", self.probe_timeout_secs),
            ("mesh.route_refresh_secs", self.route_refresh_secs),
            ("mesh.load_refresh_secs", self.load_refresh_secs),
            ("mesh.discovery_interval_secs", self.discovery_interval_secs),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        if self.local_node_name.trim().is_empty() {
            return Err(ConfigError::MissingValue("mesh.local_node_name".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle state of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    #[default]
    Offline,
    Connecting,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Online => "online",
            NodeState::Offline => "offline",
            NodeState::Connecting => "connecting",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant in the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub id: String,
    pub name: String,
    pub public_addr: String,
    pub virtual_addr: Ipv4Addr,
    pub port: u16,
    /// Base64 x25519 public key, present when the node offers vpn-overlay
    pub public_key: Option<String>,
    pub state: NodeState,
    pub last_seen: Option<DateTime<Utc>>,
    pub transports: Vec<TransportKind>,
    /// 0.0 idle to 1.0 saturated; `None` until a load signal reports
    pub load_score: Option<f64>,
    #[serde(rename = "latency_ms", with = "crate::duration_ms::option", default)]
    pub latency: Option<Duration>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub is_local: bool,
    /// Login used by session transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl MeshNode {
    /// Copy with the password masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("********".to_string());
        }
        copy
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn in_region(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region)
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }
}

/// Declarative record for a remote node, as produced by `mesh add` or discovery.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub transports: Vec<TransportKind>,
    pub public_key: Option<String>,
    pub tags: Vec<String>,
    pub region: Option<String>,
}

impl NodeSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeSpec {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

impl From<&TunnelConfig> for NodeSpec {
    fn from(config: &TunnelConfig) -> Self {
        NodeSpec {
            name: Some(config.name.clone()).filter(|n| !n.is_empty()),
            host: config.host.clone(),
            port: config.port_or_default(),
            user: config.user.clone(),
            password: config.password.clone(),
            transports: vec![config.transport],
            public_key: config.vpn_overlay.as_ref().map(|v| v.public_key.clone()),
            tags: config.tags.clone(),
            region: config.region.clone(),
        }
    }
}

/// Advisory route to one remote node, consumed by platform route programming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub interface: String,
    pub metric: u32,
    pub protocol: String,
}

/// Node selection policy of [`crate::mesh::MeshOverlay::load_balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    RoundRobin,
    LeastConnections,
    #[default]
    Latency,
}

impl LoadBalancing {
    /// Unknown names select by latency.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => LoadBalancing::RoundRobin,
            "least-connections" | "least-load" | "load" => LoadBalancing::LeastConnections,
            "latency" => LoadBalancing::Latency,
            other => {
                tracing::warn!(policy = other, "Unknown load balancing policy, using latency");
                LoadBalancing::Latency
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancing::RoundRobin => "round-robin",
            LoadBalancing::LeastConnections => "least-connections",
            LoadBalancing::Latency => "latency",
        }
    }
}

impl fmt::Display for LoadBalancing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`crate::mesh::MeshOverlay::status`].
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub address_block: String,
    pub load_balancing: LoadBalancing,
    pub local_node: Option<MeshNode>,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub nodes: Vec<MeshNode>,
    pub routes: Vec<Route>,
}
