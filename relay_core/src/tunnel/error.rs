//! Error types for the tunnel module.

use std::io;
use thiserror::Error;

use crate::config::{ConfigError, TransportKind};
use crate::probe::ProbeError;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur in tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Unknown tunnel name
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    /// No adapter is wired up for the tunnel's transport kind
    #[error("Transport '{kind}' is not supported (tunnel {name})")]
    TransportUnsupported { name: String, kind: TransportKind },

    /// Dial, handshake or authentication failure
    #[error("Connection to {target} failed: {reason}")]
    ConnectFailure { target: String, reason: String },

    /// Selection found nothing it could start
    #[error("No eligible tunnel available")]
    NoEligibleTunnel,

    /// Tunnel exists but is disabled in configuration
    #[error("Tunnel is disabled: {0}")]
    Disabled(String),

    /// Tunnel already exists
    #[error("Tunnel already exists: {0}")]
    AlreadyExists(String),

    /// Latency probe failure
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// One or more adapters reported errors while stopping
    #[error("Errors while stopping tunnels: {}", .0.join("; "))]
    StopFailed(Vec<String>),

    /// Invalid record passed to add/update
    #[error("Invalid tunnel configuration: {0}")]
    Config(#[from] ConfigError),

    /// The orchestrator scope was cancelled
    #[error("Orchestrator has been shut down")]
    ShutDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
