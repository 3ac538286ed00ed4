//! Uniform lifecycle contract for transport implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{TransportKind, TunnelConfig};
use crate::probe::LatencyProbe;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::ssh::SshAdapter;
use crate::tunnel::types::AdapterStats;

/// One adapter instance is bound to one tunnel configuration.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Name of the tunnel this adapter serves.
    fn name(&self) -> &str;

    fn transport(&self) -> TransportKind;

    /// Dials and completes the handshake. Background relay work keeps running
    /// until [`ProtocolAdapter::stop`] is called or `scope` is cancelled.
    async fn start(&self, scope: CancellationToken) -> TunnelResult<()>;

    /// Releases the session. Stopping an idle adapter is not an error.
    async fn stop(&self) -> TunnelResult<()>;

    fn status(&self) -> AdapterStats;

    /// Out-of-band latency measurement to the remote endpoint.
    async fn probe(&self) -> TunnelResult<Duration>;

    /// False for transports whose session layer is not wired up.
    fn can_start(&self) -> bool {
        true
    }
}

pub type AdapterFactory =
    Arc<dyn Fn(&TunnelConfig) -> TunnelResult<Arc<dyn ProtocolAdapter>> + Send + Sync>;

/// Maps transport kinds to adapter factories.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<TransportKind, AdapterFactory>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl AdapterRegistry {
    /// Registry with no transports.
    pub fn empty() -> Self {
        Self::default()
    }

    /// ssh gets a real adapter; the other kinds get [`UnwiredAdapter`].
    pub fn with_defaults(probe: LatencyProbe) -> Self {
        let mut registry = Self::empty();
        for kind in TransportKind::ALL {
            registry.register(kind, move |config: &TunnelConfig| {
                let adapter: Arc<dyn ProtocolAdapter> = match config.transport {
                    TransportKind::Ssh => Arc::new(SshAdapter::new(config.clone(), probe)),
                    TransportKind::VpnOverlay
                    | TransportKind::TlsCamouflage
                    | TransportKind::UdpFast => {
                        Arc::new(UnwiredAdapter::new(config.clone(), probe))
                    }
                };
                Ok(adapter)
            });
        }
        registry
    }

    pub fn register<F>(&mut self, kind: TransportKind, factory: F) -> &mut Self
    where
        F: Fn(&TunnelConfig) -> TunnelResult<Arc<dyn ProtocolAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Instantiates the adapter for `config`'s transport kind.
    pub fn create(&self, config: &TunnelConfig) -> TunnelResult<Arc<dyn ProtocolAdapter>> {
        let factory =
            self.factories
                .get(&config.transport)
                .ok_or_else(|| TunnelError::TransportUnsupported {
                    name: config.name.clone(),
                    kind: config.transport,
                })?;
        factory(config)
    }
}

/// Adapter for transports without a session implementation: probing works,
/// starting fails with [`TunnelError::TransportUnsupported`].
pub struct UnwiredAdapter {
    config: TunnelConfig,
    probe: LatencyProbe,
}

impl UnwiredAdapter {
    pub fn new(config: TunnelConfig, probe: LatencyProbe) -> Self {
        UnwiredAdapter { config, probe }
    }
}

#[async_trait]
impl ProtocolAdapter for UnwiredAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> TransportKind {
        self.config.transport
    }

    async fn start(&self, _scope: CancellationToken) -> TunnelResult<()> {
        Err(TunnelError::TransportUnsupported {
            name: self.config.name.clone(),
            kind: self.config.transport,
        })
    }

    async fn stop(&self) -> TunnelResult<()> {
        Ok(())
    }

    fn status(&self) -> AdapterStats {
        AdapterStats::default()
    }

    async fn probe(&self) -> TunnelResult<Duration> {
        Ok(self
            .probe
            .measure(&self.config.host, self.config.port_or_default())
            .await?)
    }

    fn can_start(&self) -> bool {
        false
    }
}
