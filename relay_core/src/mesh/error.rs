use std::io;
use thiserror::Error;

use crate::config::TransportKind;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Mesh overlay is not initialized")]
    NotInitialized,

    #[error("Mesh overlay is already initialized")]
    AlreadyInitialized,

    #[error("Mesh overlay has been shut down")]
    ShutDown,

    #[error("Invalid address block '{block}': {reason}")]
    AddressBlockInvalid { block: String, reason: String },

    #[error("Address block {0} has no free addresses")]
    AddressExhausted(String),

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node is offline: {0}")]
    NodeOffline(String),

    #[error("No available nodes")]
    NoAvailableNodes,

    #[error("No healthy nodes")]
    NoHealthyNodes,

    #[error("Node {0} offers no supported transport")]
    NoSuitableProtocol(String),

    #[error("Transport '{kind}' has no connector")]
    ConnectorMissing { kind: TransportKind },

    #[error("Connection to node {node} failed: {reason}")]
    ConnectFailure { node: String, reason: String },

    #[error("Operation not allowed on the local node")]
    LocalNode,

    #[error("A node at {0} is already registered")]
    Duplicate(String),

    #[error("Mesh state I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Mesh state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
