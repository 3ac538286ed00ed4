//! Core of meshrelay: tunnel orchestration and the mesh overlay.
//!
//! This crate holds everything the command line client and the management
//! API share: configuration, config encryption, logging setup, latency
//! probing, the tunnel orchestrator with its transport adapters, and the
//! mesh overlay with node registry, health checking and node selection.

pub mod config;
pub mod crypto;
pub mod discovery;
mod duration_ms;
pub mod logging;
pub mod mesh;
pub mod probe;
pub mod tunnel;

// Re-export commonly used types for convenience
pub use config::{AppConfig, ConfigError, ConfigManager, TransportKind, TunnelConfig};
pub use mesh::{MeshConfig, MeshError, MeshOverlay};
pub use tunnel::{TunnelError, TunnelOrchestrator, TunnelState, TunnelStatus};
