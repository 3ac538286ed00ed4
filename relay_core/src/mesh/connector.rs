//! Per-transport connectors used by `connect_to_node`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::info;

use crate::config::TransportKind;
use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::types::MeshNode;

/// Transport preference when the caller gives no hint.
pub const PREFERENCE: [TransportKind; 4] = [
    TransportKind::VpnOverlay,
    TransportKind::Ssh,
    TransportKind::TlsCamouflage,
    TransportKind::UdpFast,
];

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshSession {
    pub node_id: String,
    pub transport: TransportKind,
    pub remote: String,
    pub virtual_addr: Ipv4Addr,
    pub established_at: DateTime<Utc>,
    #[serde(rename = "latency_ms", with = "crate::duration_ms::option")]
    pub latency: Option<Duration>,
}

#[async_trait]
pub trait NodeConnector: Send + Sync {
    fn transport(&self) -> TransportKind;

    async fn connect(&self, node: &MeshNode) -> MeshResult<MeshSession>;
}

/// Verifies the node's endpoint accepts a TCP connection within the timeout.
#[derive(Debug, Clone, Copy)]
pub struct DialConnector {
    kind: TransportKind,
    timeout: Duration,
}

impl DialConnector {
    pub fn new(kind: TransportKind, timeout: Duration) -> Self {
        DialConnector { kind, timeout }
    }
}

#[async_trait]
impl NodeConnector for DialConnector {
    fn transport(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self, node: &MeshNode) -> MeshResult<MeshSession> {
        let remote = format!("{}:{}", node.public_addr, node.port);
        let failure = |reason: String| MeshError::ConnectFailure {
            node: node.id.clone(),
            reason,
        };

        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(remote.as_str())).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => return Err(failure(e.to_string())),
            Err(_) => return Err(failure(format!("timed out after {:?}", self.timeout))),
        }
        let latency = start.elapsed();

        info!(node_id = %node.id, transport = %self.kind, %remote, "Connected to node");
        Ok(MeshSession {
            node_id: node.id.clone(),
            transport: self.kind,
            remote,
            virtual_addr: node.virtual_addr,
            established_at: Utc::now(),
            latency: Some(latency),
        })
    }
}

#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: HashMap<TransportKind, Arc<dyn NodeConnector>>,
}

impl ConnectorSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A [`DialConnector`] for every transport kind.
    pub fn with_defaults(timeout: Duration) -> Self {
        let mut set = Self::empty();
        for kind in TransportKind::ALL {
            set.register(Arc::new(DialConnector::new(kind, timeout)));
        }
        set
    }

    pub fn register(&mut self, connector: Arc<dyn NodeConnector>) -> &mut Self {
        self.connectors.insert(connector.transport(), connector);
        self
    }

    /// Picks the connector for `hint`, or the first transport in
    /// [`PREFERENCE`] that the node advertises and a connector exists for.
    pub fn choose(
        &self,
        node: &MeshNode,
        hint: Option<TransportKind>,
    ) -> MeshResult<Arc<dyn NodeConnector>> {
        if let Some(kind) = hint {
            if !node.supports(kind) {
                return Err(MeshError::NoSuitableProtocol(node.id.clone()));
            }
            return self
                .connectors
                .get(&kind)
                .cloned()
                .ok_or(MeshError::ConnectorMissing { kind });
        }

        PREFERENCE
            .iter()
            .filter(|kind| node.supports(**kind))
            .find_map(|kind| self.connectors.get(kind).cloned())
            .ok_or_else(|| MeshError::NoSuitableProtocol(node.id.clone()))
    }
}
