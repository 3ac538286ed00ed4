//! The mesh overlay: node inventory plus its background workers.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportKind;
use crate::discovery::ServerDiscovery;
use crate::mesh::connector::{ConnectorSet, MeshSession};
use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::health::{HealthMonitor, HealthReport, NodeProber, TcpProber};
use crate::mesh::identity::{IdSource, NodeKeyPair, RandomIdSource};
use crate::mesh::ipam::AddressPool;
use crate::mesh::registry::NodeRegistry;
use crate::mesh::selector::{self, NodeSelector};
use crate::mesh::state::MeshState;
use crate::mesh::types::{
    LoadBalancing, MeshConfig, MeshNode, MeshStatus, NodeSpec, NodeState, Route,
};
use crate::probe::LatencyProbe;

/// Listening port advertised by the local node.
pub const DEFAULT_MESH_PORT: u16 = 51820;

/// Source of per-node load scores in [0, 1]. `None` means "no signal".
#[async_trait]
pub trait LoadSignal: Send + Sync {
    async fn load(&self, node: &MeshNode) -> Option<f64>;
}

pub struct MeshOverlayBuilder {
    config: MeshConfig,
    prober: Option<Arc<dyn NodeProber>>,
    ids: Option<Arc<dyn IdSource>>,
    connectors: Option<ConnectorSet>,
    load_signal: Option<Arc<dyn LoadSignal>>,
    discovery: Option<Arc<dyn ServerDiscovery>>,
}

impl MeshOverlayBuilder {
    pub fn prober(mut self, prober: Arc<dyn NodeProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn connectors(mut self, connectors: ConnectorSet) -> Self {
        self.connectors = Some(connectors);
        self
    }

    pub fn load_signal(mut self, signal: Arc<dyn LoadSignal>) -> Self {
        self.load_signal = Some(signal);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn ServerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn build(self) -> MeshOverlay {
        let timeout = self.config.probe_timeout();
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(TcpProber::new(LatencyProbe::new(timeout))));
        let registry = Arc::new(NodeRegistry::new(self.config.interface_name.clone()));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&prober),
            self.config.health_check_interval(),
        ));

        MeshOverlay {
            inner: Arc::new(OverlayInner {
                selector: NodeSelector::new(LoadBalancing::from_name(&self.config.load_balancing)),
                registry,
                health,
                prober,
                ids: self
                    .ids
                    .unwrap_or_else(|| Arc::new(RandomIdSource::from_entropy())),
                connectors: self
                    .connectors
                    .unwrap_or_else(|| ConnectorSet::with_defaults(timeout)),
                load_signal: self.load_signal,
                discovery: self.discovery,
                key_pair: Mutex::new(None),
                scope: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                config: self.config,
            }),
        }
    }
}

struct OverlayInner {
    config: MeshConfig,
    registry: Arc<NodeRegistry>,
    health: Arc<HealthMonitor>,
    prober: Arc<dyn NodeProber>,
    ids: Arc<dyn IdSource>,
    connectors: ConnectorSet,
    selector: NodeSelector,
    load_signal: Option<Arc<dyn LoadSignal>>,
    discovery: Option<Arc<dyn ServerDiscovery>>,
    key_pair: Mutex<Option<NodeKeyPair>>,
    scope: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one overlay instance. Clones share the same overlay.
#[derive(Clone)]
pub struct MeshOverlay {
    inner: Arc<OverlayInner>,
}

impl MeshOverlay {
    pub fn new(config: MeshConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: MeshConfig) -> MeshOverlayBuilder {
        MeshOverlayBuilder {
            config,
            prober: None,
            ids: None,
            connectors: None,
            load_signal: None,
            discovery: None,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.registry.is_initialized()
    }

    fn ensure_running(&self) -> MeshResult<()> {
        if self.inner.scope.is_cancelled() {
            return Err(MeshError::ShutDown);
        }
        Ok(())
    }

    /// Creates the local node on the first address of the block, generates
    /// its key pair and starts the background workers.
    pub async fn initialize(&self) -> MeshResult<MeshNode> {
        self.ensure_running()?;
        let config = &self.inner.config;
        if self.inner.registry.is_initialized() {
            return Err(MeshError::AlreadyInitialized);
        }
        let pool = AddressPool::new(&config.address_block)?;
        let keys = self.inner.ids.key_pair();

        let local = MeshNode {
            id: self.inner.ids.node_id(),
            name: config.local_node_name.clone(),
            public_addr: local_ip(),
            virtual_addr: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_MESH_PORT,
            public_key: Some(keys.public_key.clone()),
            state: NodeState::Online,
            last_seen: Some(Utc::now()),
            transports: vec![TransportKind::Ssh, TransportKind::VpnOverlay],
            load_score: None,
            latency: None,
            tags: config.tags.clone(),
            region: config.regions.first().cloned(),
            capabilities: ["coordinator", "routing", "loadbalancer"]
                .into_iter()
                .map(|c| (c.to_string(), true))
                .collect(),
            is_local: true,
            user: None,
            password: None,
        };

        let local = self.inner.registry.initialize(pool, local)?;
        *self.key_pair_slot() = Some(keys);
        self.start();

        info!(
            node_id = %local.id,
            name = %local.name,
            virtual_addr = %local.virtual_addr,
            block = %config.address_block,
            "Mesh overlay initialized"
        );
        Ok(local)
    }

    /// Rebuilds the overlay from persisted state without starting workers.
    pub fn restore(&self, state: MeshState) -> MeshResult<()> {
        self.ensure_running()?;
        if state.config.address_block != self.inner.config.address_block {
            warn!(
                persisted = %state.config.address_block,
                configured = %self.inner.config.address_block,
                "Persisted mesh state uses a different address block"
            );
        }
        let pool = AddressPool::new(&self.inner.config.address_block)?;
        self.inner.registry.restore(pool, state.nodes)?;

        if let Some(encoded) = state.local_private_key.as_deref() {
            match NodeKeyPair::from_private_key(encoded) {
                Some(keys) => *self.key_pair_slot() = Some(keys),
                None => warn!("Persisted local private key is not valid base64 x25519"),
            }
        }
        debug!(nodes = self.inner.registry.snapshot().len(), "Mesh overlay restored");
        Ok(())
    }

    /// Snapshot suitable for [`MeshState::save`].
    pub fn to_state(&self) -> MeshState {
        MeshState {
            config: self.inner.config.clone(),
            local_private_key: self
                .key_pair_slot()
                .as_ref()
                .map(|k| k.private_key.clone()),
            nodes: self.inner.registry.snapshot(),
        }
    }

    fn key_pair_slot(&self) -> std::sync::MutexGuard<'_, Option<NodeKeyPair>> {
        self.inner
            .key_pair
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the health, route, load and discovery workers. Calling it again
    /// while they run does nothing.
    pub fn start(&self) {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.inner.scope.is_cancelled() {
            return;
        }
        let config = &self.inner.config;
        let scope = self.inner.scope.clone();

        let health = Arc::clone(&self.inner.health);
        let health_scope = scope.clone();
        workers.push(tokio::spawn(async move { health.run(health_scope).await }));

        let registry = Arc::clone(&self.inner.registry);
        workers.push(spawn_periodic(scope.clone(), config.route_refresh(), "routes", move || {
            let changed = registry.reconcile_routes();
            if changed > 0 {
                debug!(changed, "Reconciled mesh routes");
            }
            async {}
        }));

        if let Some(signal) = self.inner.load_signal.clone() {
            let registry = Arc::clone(&self.inner.registry);
            let load_scope = scope.clone();
            workers.push(spawn_periodic(scope.clone(), config.load_refresh(), "load", move || {
                let signal = Arc::clone(&signal);
                let registry = Arc::clone(&registry);
                let scope = load_scope.clone();
                async move {
                    for node in registry.remotes() {
                        let load = signal.load(&node).await;
                        if scope.is_cancelled() {
                            return;
                        }
                        registry.set_load(&node.id, load);
                    }
                }
            }));
        }

        if config.auto_discovery && self.inner.discovery.is_some() {
            let overlay = self.clone();
            workers.push(spawn_periodic(scope, config.discovery_interval(), "discovery", move || {
                let overlay = overlay.clone();
                async move {
                    overlay.discover_once().await;
                }
            }));
        }
        debug!(workers = workers.len(), "Mesh workers started");
    }

    /// Adds records from the discovery source that are not registered yet.
    /// Returns how many nodes were added.
    pub async fn discover_once(&self) -> usize {
        let Some(discovery) = self.inner.discovery.clone() else {
            return 0;
        };
        let records = match discovery.discover().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Mesh discovery failed");
                return 0;
            }
        };

        let mut added = 0;
        for record in records.iter().filter(|r| r.enabled) {
            if self
                .inner
                .registry
                .contains_endpoint(&record.host, record.port_or_default())
            {
                continue;
            }
            match self.add_server(NodeSpec::from(record)).await {
                Ok(_) => added += 1,
                Err(MeshError::AddressExhausted(block)) => {
                    warn!(%block, "Address block full, stopping discovery pass");
                    break;
                }
                Err(e) => warn!(host = %record.host, error = %e, "Could not add discovered node"),
            }
        }
        added
    }

    /// Registers a remote node on the next free address.
    ///
    /// The initial probe is best effort: an unreachable node is registered as
    /// offline. Address allocation and registration happen under one lock.
    pub async fn add_server(&self, spec: NodeSpec) -> MeshResult<MeshNode> {
        self.ensure_running()?;
        if !self.inner.registry.is_initialized() {
            return Err(MeshError::NotInitialized);
        }
        let config = &self.inner.config;

        let mut node = MeshNode {
            id: self.inner.ids.node_id(),
            name: spec.name.unwrap_or_else(|| spec.host.clone()),
            public_addr: spec.host,
            virtual_addr: Ipv4Addr::UNSPECIFIED,
            port: spec.port,
            public_key: spec.public_key,
            state: NodeState::Connecting,
            last_seen: None,
            transports: if spec.transports.is_empty() {
                vec![TransportKind::Ssh]
            } else {
                spec.transports
            },
            load_score: None,
            latency: None,
            tags: if spec.tags.is_empty() {
                config.tags.clone()
            } else {
                spec.tags
            },
            region: spec.region.or_else(|| config.regions.first().cloned()),
            capabilities: BTreeMap::new(),
            is_local: false,
            user: spec.user,
            password: spec.password,
        };

        match self.inner.prober.probe(&node).await {
            Ok(latency) => {
                node.state = NodeState::Online;
                node.latency = Some(latency);
                node.last_seen = Some(Utc::now());
            }
            Err(e) => {
                warn!(
                    name = %node.name,
                    error = %e,
                    "Initial probe failed, adding node as offline"
                );
                node.state = NodeState::Offline;
            }
        }

        self.ensure_running()?;
        self.inner.registry.insert_remote(move |_| node)
    }

    /// Explicit administrative removal.
    pub fn remove_node(&self, id: &str) -> MeshResult<MeshNode> {
        self.inner.registry.remove(id)
    }

    /// Best remote node by weighted score; `region` adds a preference bonus.
    pub fn get_best_node(&self, region: Option<&str>) -> MeshResult<MeshNode> {
        selector::best_node(&self.inner.registry.snapshot(), region)
    }

    pub fn nodes_by_region(&self, region: &str) -> Vec<MeshNode> {
        selector::by_region(&self.inner.registry.snapshot(), region)
    }

    pub fn nodes_by_tag(&self, tag: &str) -> Vec<MeshNode> {
        selector::by_tag(&self.inner.registry.snapshot(), tag)
    }

    pub fn nodes(&self) -> Vec<MeshNode> {
        self.inner.registry.snapshot()
    }

    pub fn node(&self, id: &str) -> Option<MeshNode> {
        self.inner.registry.get(id)
    }

    pub fn local_node(&self) -> Option<MeshNode> {
        self.inner.registry.local()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.inner.registry.routes()
    }

    /// Connects over `hint`, or the preferred transport the node supports.
    pub async fn connect_to_node(
        &self,
        id: &str,
        hint: Option<TransportKind>,
    ) -> MeshResult<MeshSession> {
        let node = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;
        if node.is_local {
            return Err(MeshError::LocalNode);
        }
        if !node.is_online() {
            return Err(MeshError::NodeOffline(id.to_string()));
        }

        let connector = self.inner.connectors.choose(&node, hint)?;
        debug!(node_id = %id, transport = %connector.transport(), "Connecting to node");
        connector.connect(&node).await
    }

    /// Picks a healthy node for `destination` with the configured policy.
    pub fn load_balance(&self, destination: &str) -> MeshResult<MeshNode> {
        let healthy = selector::healthy(&self.inner.registry.snapshot());
        let node = self.inner.selector.select(&healthy)?;
        debug!(
            destination,
            node_id = %node.id,
            policy = %self.inner.selector.policy(),
            "Load balanced"
        );
        Ok(node)
    }

    /// Runs one health-check pass right away.
    pub async fn check_health(&self) -> HealthReport {
        self.inner.health.check_once(&self.inner.scope).await
    }

    pub fn status(&self) -> MeshStatus {
        let nodes: Vec<MeshNode> = self
            .inner
            .registry
            .snapshot()
            .iter()
            .map(MeshNode::redacted)
            .collect();
        let online_nodes = nodes.iter().filter(|n| n.is_online()).count();

        MeshStatus {
            address_block: self.inner.config.address_block.clone(),
            load_balancing: self.inner.selector.policy(),
            local_node: nodes.iter().find(|n| n.is_local).cloned(),
            total_nodes: nodes.len(),
            online_nodes,
            offline_nodes: nodes.len() - online_nodes,
            routes: self.inner.registry.routes(),
            nodes,
        }
    }

    /// Cancels the overlay scope and waits for the workers to finish.
    pub async fn shutdown(&self) {
        self.inner.scope.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Mesh worker ended abnormally");
            }
        }
        info!("Mesh overlay stopped");
    }
}

/// Waits on the timer or the scope, runs one bounded unit of work, repeats.
fn spawn_periodic<F, Fut>(
    scope: CancellationToken,
    period: Duration,
    worker: &'static str,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        _ = tick() => {}
                    }
                }
            }
        }
        debug!(worker, "Mesh worker stopped");
    })
}

/// Address of the interface holding the default route. Nothing is sent.
fn local_ip() -> String {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
}
