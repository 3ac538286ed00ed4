//! Tunnel lifecycle management.
//!
//! A tunnel is one configured server connection driven by a transport
//! [`ProtocolAdapter`]. The [`TunnelOrchestrator`] owns every tunnel's adapter
//! and status, picks a tunnel when auto-select is on, and the
//! [`FailoverSupervisor`] restarts everything when nothing stays up.

mod adapter;
mod error;
mod failover;
mod orchestrator;
mod policy;
mod ssh;
pub mod types;

pub use adapter::{AdapterFactory, AdapterRegistry, ProtocolAdapter, UnwiredAdapter};
pub use error::{TunnelError, TunnelResult};
pub use failover::FailoverSupervisor;
pub use orchestrator::{OrchestratorSettings, TunnelOrchestrator, DEFAULT_RESTART_PAUSE};
pub use policy::{lowest_latency, SelectionMethod};
pub use ssh::SshAdapter;
pub use types::{AdapterStats, TunnelEvent, TunnelState, TunnelStatus};
