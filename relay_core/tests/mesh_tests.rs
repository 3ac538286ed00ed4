use async_trait::async_trait;
use chrono::Utc;
use relay_core::config::{TransportKind, TunnelConfig};
use relay_core::discovery::{DiscoveryResult, ServerDiscovery};
use relay_core::mesh::{
    ConnectorSet, MeshConfig, MeshError, MeshNode, MeshOverlay, MeshResult, MeshSession,
    MeshState, NodeConnector, NodeProber, NodeSpec, NodeState, RandomIdSource,
};
use relay_core::probe::ProbeError;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers from a per-host table; hosts not in the table answer in 5ms.
#[derive(Default)]
struct ScriptedProber {
    answers: Mutex<HashMap<String, Option<Duration>>>,
}

impl ScriptedProber {
    fn set(&self, host: &str, answer: Option<Duration>) {
        self.answers.lock().unwrap().insert(host.to_string(), answer);
    }
}

#[async_trait]
impl NodeProber for ScriptedProber {
    async fn probe(&self, node: &MeshNode) -> Result<Duration, ProbeError> {
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&node.public_addr)
            .copied()
            .unwrap_or(Some(Duration::from_millis(5)));
        answer.ok_or_else(|| ProbeError::Timeout {
            target: node.public_addr.clone(),
            timeout: Duration::from_secs(1),
        })
    }
}

/// Connector that succeeds without touching the network.
struct LoopbackConnector(TransportKind);

#[async_trait]
impl NodeConnector for LoopbackConnector {
    fn transport(&self) -> TransportKind {
        self.0
    }

    async fn connect(&self, node: &MeshNode) -> MeshResult<MeshSession> {
        Ok(MeshSession {
            node_id: node.id.clone(),
            transport: self.0,
            remote: format!("{}:{}", node.public_addr, node.port),
            virtual_addr: node.virtual_addr,
            established_at: Utc::now(),
            latency: None,
        })
    }
}

fn mesh_config(block: &str) -> MeshConfig {
    MeshConfig {
        health_check_interval_secs: 3600,
        ..MeshConfig::default().with_address_block(block)
    }
}

fn overlay(config: MeshConfig, seed: u64) -> (MeshOverlay, Arc<ScriptedProber>) {
    let prober = Arc::new(ScriptedProber::default());
    let mut connectors = ConnectorSet::empty();
    connectors.register(Arc::new(LoopbackConnector(TransportKind::Ssh)));
    let overlay = MeshOverlay::builder(config)
        .prober(Arc::clone(&prober) as Arc<dyn NodeProber>)
        .id_source(Arc::new(RandomIdSource::seeded(seed)))
        .connectors(connectors)
        .build();
    (overlay, prober)
}

fn spec(host: &str) -> NodeSpec {
    NodeSpec::new(host, 22).with_name(host)
}

#[tokio::test]
async fn test_addresses_are_assigned_in_order() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 1);

    let local = mesh.initialize().await.unwrap();
    assert!(local.is_local);
    assert_eq!(local.virtual_addr, Ipv4Addr::new(10, 99, 0, 1));
    assert!(local.public_key.is_some());

    let mut assigned = Vec::new();
    for host in ["198.51.100.1", "198.51.100.2", "198.51.100.3"] {
        assigned.push(mesh.add_server(spec(host)).await.unwrap().virtual_addr);
    }
    assert_eq!(
        assigned,
        vec![
            Ipv4Addr::new(10, 99, 0, 2),
            Ipv4Addr::new(10, 99, 0, 3),
            Ipv4Addr::new(10, 99, 0, 4),
        ]
    );

    let routes = mesh.routes();
    assert_eq!(routes.len(), 3);
    assert!(routes.iter().all(|r| r.destination.prefix_len() == 32));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_block_exhaustion_and_reuse() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 2);
    mesh.initialize().await.unwrap();

    let mut last = None;
    for port in 0..253u16 {
        let node = mesh
            .add_server(NodeSpec::new("203.0.113.10", 2000 + port))
            .await
            .unwrap();
        last = Some(node);
    }
    let err = mesh
        .add_server(NodeSpec::new("203.0.113.10", 4000))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::AddressExhausted(_)));

    let last = last.unwrap();
    assert_eq!(last.virtual_addr, Ipv4Addr::new(10, 99, 0, 254));
    mesh.remove_node(&last.id).unwrap();
    let reused = mesh
        .add_server(NodeSpec::new("203.0.113.10", 4000))
        .await
        .unwrap();
    assert_eq!(reused.virtual_addr, last.virtual_addr);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_invalid_block() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/33"), 3);
    assert!(matches!(
        mesh.initialize().await,
        Err(MeshError::AddressBlockInvalid { .. })
    ));
    assert!(!mesh.is_initialized());
}

#[tokio::test]
async fn test_initialize_twice() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 4);
    mesh.initialize().await.unwrap();
    assert!(matches!(
        mesh.initialize().await,
        Err(MeshError::AlreadyInitialized)
    ));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_add_requires_initialize() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 5);
    assert!(matches!(
        mesh.add_server(spec("198.51.100.1")).await,
        Err(MeshError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_duplicate_endpoint_is_rejected() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 6);
    mesh.initialize().await.unwrap();
    mesh.add_server(spec("198.51.100.1")).await.unwrap();

    assert!(matches!(
        mesh.add_server(spec("198.51.100.1")).await,
        Err(MeshError::Duplicate(_))
    ));
    let next = mesh.add_server(spec("198.51.100.2")).await.unwrap();
    assert_eq!(next.virtual_addr, Ipv4Addr::new(10, 99, 0, 3));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_tag_and_region_filters() {
    let (mesh, prober) = overlay(mesh_config("10.99.0.0/24"), 7);
    prober.set("198.51.100.3", None);
    mesh.initialize().await.unwrap();
    mesh.add_server(spec("198.51.100.1").with_tags(["gaming"]).with_region("eu"))
        .await
        .unwrap();
    mesh.add_server(spec("198.51.100.2").with_tags(["gaming", "eu-west"]))
        .await
        .unwrap();
    let down = mesh
        .add_server(spec("198.51.100.3").with_tags(["gaming"]).with_region("eu"))
        .await
        .unwrap();
    assert_eq!(down.state, NodeState::Offline);
    mesh.add_server(spec("198.51.100.4").with_tags(["streaming"]).with_region("eu"))
        .await
        .unwrap();

    let gaming: Vec<String> = mesh
        .nodes_by_tag("gaming")
        .into_iter()
        .map(|n| n.public_addr)
        .collect();
    assert_eq!(gaming, vec!["198.51.100.1", "198.51.100.2"]);

    let eu: Vec<String> = mesh
        .nodes_by_region("eu")
        .into_iter()
        .map(|n| n.public_addr)
        .collect();
    assert_eq!(eu, vec!["198.51.100.1", "198.51.100.4"]);
    assert!(mesh.nodes_by_tag("unknown").is_empty());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_adds_get_unique_addresses() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 11);
    mesh.initialize().await.unwrap();

    let hosts: Vec<String> = (1..=50).map(|i| format!("198.51.100.{i}")).collect();
    let added =
        futures::future::join_all(hosts.iter().map(|host| mesh.add_server(spec(host)))).await;

    let mut addrs: Vec<Ipv4Addr> = added.into_iter().map(|n| n.unwrap().virtual_addr).collect();
    addrs.sort();
    addrs.dedup();
    assert_eq!(addrs.len(), 50);
    assert!(!addrs.contains(&Ipv4Addr::new(10, 99, 0, 1)));
    assert_eq!(mesh.routes().len(), 50);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_best_node_prefers_latency_then_region() {
    let (mesh, prober) = overlay(mesh_config("10.99.0.0/24"), 8);
    prober.set("198.51.100.1", Some(Duration::from_millis(30)));
    prober.set("198.51.100.2", Some(Duration::from_millis(10)));
    prober.set("198.51.100.3", Some(Duration::from_millis(10)));
    mesh.initialize().await.unwrap();
    mesh.add_server(spec("198.51.100.1").with_region("us"))
        .await
        .unwrap();
    let fast = mesh.add_server(spec("198.51.100.2")).await.unwrap();
    mesh.add_server(spec("198.51.100.3")).await.unwrap();

    for _ in 0..3 {
        assert_eq!(mesh.get_best_node(None).unwrap().id, fast.id);
    }
    assert_eq!(
        mesh.get_best_node(Some("us")).unwrap().public_addr,
        "198.51.100.1"
    );
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_best_node_without_remotes() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 9);
    mesh.initialize().await.unwrap();
    assert!(matches!(
        mesh.get_best_node(None),
        Err(MeshError::NoAvailableNodes)
    ));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_node_is_added_offline() {
    let (mesh, prober) = overlay(mesh_config("10.99.0.0/24"), 10);
    prober.set("198.51.100.9", None);
    mesh.initialize().await.unwrap();

    let node = mesh.add_server(spec("198.51.100.9")).await.unwrap();
    assert_eq!(node.state, NodeState::Offline);
    assert!(matches!(
        mesh.connect_to_node(&node.id, None).await,
        Err(MeshError::NodeOffline(_))
    ));
    assert!(matches!(
        mesh.load_balance("example.org"),
        Err(MeshError::NoHealthyNodes)
    ));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_node() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 11);
    let local = mesh.initialize().await.unwrap();
    let node = mesh.add_server(spec("198.51.100.1")).await.unwrap();

    let session = mesh.connect_to_node(&node.id, None).await.unwrap();
    assert_eq!(session.transport, TransportKind::Ssh);
    assert_eq!(session.virtual_addr, node.virtual_addr);

    assert!(matches!(
        mesh.connect_to_node(&node.id, Some(TransportKind::UdpFast)).await,
        Err(MeshError::NoSuitableProtocol(_))
    ));
    assert!(matches!(
        mesh.connect_to_node("node-missing", None).await,
        Err(MeshError::NotFound(_))
    ));
    assert!(matches!(
        mesh.connect_to_node(&local.id, None).await,
        Err(MeshError::LocalNode)
    ));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_round_robin_rotates() {
    let config = MeshConfig {
        load_balancing: "round-robin".into(),
        ..mesh_config("10.99.0.0/24")
    };
    let (mesh, _) = overlay(config, 12);
    mesh.initialize().await.unwrap();
    mesh.add_server(spec("198.51.100.1")).await.unwrap();
    mesh.add_server(spec("198.51.100.2")).await.unwrap();

    let picks: Vec<String> = (0..3)
        .map(|_| mesh.load_balance("example.org").unwrap().public_addr)
        .collect();
    assert_ne!(picks[0], picks[1]);
    assert_eq!(picks[0], picks[2]);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_health_check_moves_nodes_between_states() {
    let (mesh, prober) = overlay(mesh_config("10.99.0.0/24"), 13);
    mesh.initialize().await.unwrap();
    let node = mesh.add_server(spec("198.51.100.1")).await.unwrap();
    assert_eq!(node.state, NodeState::Online);

    prober.set("198.51.100.1", None);
    let report = mesh.check_health().await;
    assert_eq!(report.probed, 1);
    assert_eq!(report.offline, 1);
    assert_eq!(mesh.node(&node.id).unwrap().state, NodeState::Offline);
    assert_eq!(mesh.status().offline_nodes, 1);

    prober.set("198.51.100.1", Some(Duration::from_millis(7)));
    mesh.check_health().await;
    let recovered = mesh.node(&node.id).unwrap();
    assert_eq!(recovered.state, NodeState::Online);
    assert_eq!(recovered.latency, Some(Duration::from_millis(7)));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_status_masks_passwords() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 14);
    mesh.initialize().await.unwrap();
    let mut with_login = spec("198.51.100.1");
    with_login.user = Some("root".into());
    with_login.password = Some("s3cret".into());
    mesh.add_server(with_login).await.unwrap();

    let status = mesh.status();
    assert_eq!(status.total_nodes, 2);
    assert_eq!(status.online_nodes, 2);
    assert!(status.local_node.is_some());
    let remote = status.nodes.iter().find(|n| !n.is_local).unwrap();
    assert_eq!(remote.password.as_deref(), Some("********"));
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh-state.json");

    let (first, _) = overlay(mesh_config("10.99.0.0/24"), 15);
    let local = first.initialize().await.unwrap();
    let a = first.add_server(spec("198.51.100.1")).await.unwrap();
    let b = first.add_server(spec("198.51.100.2")).await.unwrap();
    first.to_state().save(&path).unwrap();
    first.shutdown().await;

    let (second, _) = overlay(mesh_config("10.99.0.0/24"), 16);
    second.restore(MeshState::load(&path).unwrap()).unwrap();
    assert!(second.is_initialized());
    assert_eq!(second.local_node().unwrap().id, local.id);
    assert_eq!(second.node(&a.id).unwrap().virtual_addr, a.virtual_addr);
    assert_eq!(second.node(&b.id).unwrap().virtual_addr, b.virtual_addr);
    assert_eq!(second.routes().len(), 2);
    assert_eq!(
        second.to_state().local_private_key,
        first.to_state().local_private_key
    );

    let c = second.add_server(spec("198.51.100.3")).await.unwrap();
    assert_eq!(c.virtual_addr, Ipv4Addr::new(10, 99, 0, 4));
    assert!(matches!(
        second.initialize().await,
        Err(MeshError::AlreadyInitialized)
    ));
    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let (mesh, _) = overlay(mesh_config("10.99.0.0/24"), 17);
    mesh.initialize().await.unwrap();
    mesh.shutdown().await;

    assert!(matches!(
        mesh.add_server(spec("198.51.100.1")).await,
        Err(MeshError::ShutDown)
    ));
    assert!(matches!(mesh.initialize().await, Err(MeshError::ShutDown)));
}

struct FixedDiscovery(Vec<TunnelConfig>);

#[async_trait]
impl ServerDiscovery for FixedDiscovery {
    async fn discover(&self) -> DiscoveryResult<Vec<TunnelConfig>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_discovery_adds_only_new_enabled_records() {
    let mut disabled = TunnelConfig::new("later", "198.51.100.8", 443);
    disabled.enabled = false;
    let discovery = FixedDiscovery(vec![
        TunnelConfig::new("edge", "198.51.100.7", 22).with_user("root"),
        disabled,
    ]);

    let prober = Arc::new(ScriptedProber::default());
    let mesh = MeshOverlay::builder(mesh_config("10.99.0.0/24"))
        .prober(prober as Arc<dyn NodeProber>)
        .id_source(Arc::new(RandomIdSource::seeded(18)))
        .discovery(Arc::new(discovery))
        .build();
    mesh.initialize().await.unwrap();

    assert_eq!(mesh.discover_once().await, 1);
    assert_eq!(mesh.discover_once().await, 0);
    let remote = mesh.nodes().into_iter().find(|n| !n.is_local).unwrap();
    assert_eq!(remote.name, "edge");
    assert_eq!(remote.user.as_deref(), Some("root"));
    mesh.shutdown().await;
}
