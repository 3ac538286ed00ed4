//! Mesh overlay of relay nodes.
//!
//! Nodes get virtual addresses from a private block, are health-checked in
//! the background and can be ranked or load balanced independently of any
//! single tunnel.

mod connector;
mod error;
mod health;
mod identity;
mod ipam;
mod overlay;
mod registry;
pub mod selector;
mod state;
mod types;

pub use connector::{ConnectorSet, DialConnector, MeshSession, NodeConnector, PREFERENCE};
pub use error::{MeshError, MeshResult};
pub use health::{HealthMonitor, HealthReport, NodeProber, TcpProber};
pub use identity::{IdSource, NodeKeyPair, RandomIdSource};
pub use ipam::AddressPool;
pub use overlay::{LoadSignal, MeshOverlay, MeshOverlayBuilder, DEFAULT_MESH_PORT};
pub use registry::{NodeRegistry, NodeTransition};
pub use selector::NodeSelector;
pub use state::{MeshState, STATE_FILE};
pub use types::{
    LoadBalancing, MeshConfig, MeshNode, MeshStatus, NodeSpec, NodeState, Route,
};
