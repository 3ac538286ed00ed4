//! Type definitions for the tunnel module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{TransportKind, TunnelConfig};

/// Lifecycle state of a tunnel.
///
/// `disconnected -> connecting -> connected`, `connecting -> error` on adapter
/// failure, and any state `-> disconnected` on stop. `error` is re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Error => "error",
        }
    }

    /// Connected or on its way there.
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Connected)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-state snapshot of one tunnel. Always handed out as a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: TunnelState,
    pub start_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(rename = "latency_ms", with = "crate::duration_ms::option", default)]
    pub latency: Option<Duration>,
    pub local_port: u16,
}

impl TunnelStatus {
    pub fn new(config: &TunnelConfig) -> Self {
        TunnelStatus {
            name: config.name.clone(),
            transport: config.transport,
            state: TunnelState::Disconnected,
            start_time: None,
            last_error: None,
            bytes_sent: 0,
            bytes_received: 0,
            latency: None,
            local_port: config.local_port,
        }
    }
}

/// Adapter-side counters merged into [`TunnelStatus`] snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub local_addr: Option<SocketAddr>,
}

/// Broadcast on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelEvent {
    pub name: String,
    pub state: TunnelState,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}
