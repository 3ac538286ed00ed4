//! Periodic reachability checks for remote nodes.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mesh::registry::{NodeRegistry, NodeTransition};
use crate::mesh::types::{MeshNode, NodeState};
use crate::probe::{LatencyProbe, ProbeError};

/// Out-of-band reachability check for one node.
#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn probe(&self, node: &MeshNode) -> Result<Duration, ProbeError>;
}

/// Probes a node's public address with [`LatencyProbe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber {
    probe: LatencyProbe,
}

impl TcpProber {
    pub fn new(probe: LatencyProbe) -> Self {
        TcpProber { probe }
    }
}

#[async_trait]
impl NodeProber for TcpProber {
    async fn probe(&self, node: &MeshNode) -> Result<Duration, ProbeError> {
        self.probe.measure(&node.public_addr, node.port).await
    }
}

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub online: usize,
    pub offline: usize,
    pub transitions: Vec<NodeTransition>,
}

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    prober: Arc<dyn NodeProber>,
    interval: Duration,
    /// Held for a whole pass so ticks and one-shot checks never overlap.
    pass: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        prober: Arc<dyn NodeProber>,
        interval: Duration,
    ) -> Self {
        HealthMonitor {
            registry,
            prober,
            interval,
            pass: Mutex::new(()),
        }
    }

    /// Probes every remote node once, concurrently, applying each result as
    /// it arrives. Results that land after `scope` is cancelled are dropped.
    /// A call made while another pass runs waits for it to finish.
    pub async fn check_once(&self, scope: &CancellationToken) -> HealthReport {
        let _pass = self.pass.lock().await;
        let nodes = self.registry.remotes();

        let outcomes = join_all(nodes.iter().map(|node| async move {
            let outcome = self.prober.probe(node).await.map_err(|e| e.to_string());
            if scope.is_cancelled() {
                return None;
            }
            let online = outcome.is_ok();
            let transition = self.registry.apply_probe(&node.id, outcome, Utc::now());
            Some((online, transition))
        }))
        .await;

        let mut report = HealthReport::default();
        for (online, transition) in outcomes.into_iter().flatten() {
            report.probed += 1;
            if online {
                report.online += 1;
            } else {
                report.offline += 1;
            }
            if let Some(transition) = transition {
                log_transition(&transition);
                report.transitions.push(transition);
            }
        }
        report
    }

    /// Ticks until `scope` is cancelled. A slow pass delays the next tick
    /// instead of overlapping with it.
    pub async fn run(&self, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        debug!(interval_secs = self.interval.as_secs(), "Health monitor started");

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        report = self.check_once(&scope) => {
                            debug!(
                                probed = report.probed,
                                online = report.online,
                                offline = report.offline,
                                "Health check pass finished"
                            );
                        }
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    }
}

fn log_transition(transition: &NodeTransition) {
    match transition.to {
        NodeState::Online => info!(
            node_id = %transition.id,
            name = %transition.name,
            from = %transition.from,
            "Node recovered"
        ),
        NodeState::Offline => warn!(
            node_id = %transition.id,
            name = %transition.name,
            from = %transition.from,
            "Node failed health check"
        ),
        NodeState::Connecting => debug!(node_id = %transition.id, "Node connecting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::mesh::ipam::AddressPool;
    use std::collections::{BTreeMap, HashMap};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a per-host script; hosts without an entry fail.
    #[derive(Default)]
    struct ScriptedProber {
        answers: std::sync::Mutex<HashMap<String, Option<Duration>>>,
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
                .flatten();
            answer.ok_or_else(|| ProbeError::Command {
                target: node.public_addr.clone(),
                reason: "scripted failure".to_string(),
            })
        }
    }

    /// Slow prober that records the most probes it ever saw in flight.
    #[derive(Default)]
    struct SlowProber {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl NodeProber for SlowProber {
        async fn probe(&self, _node: &MeshNode) -> Result<Duration, ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Duration::from_millis(5))
        }
    }

    fn node(id: &str, host: &str) -> MeshNode {
        MeshNode {
            id: id.to_string(),
            name: id.to_string(),
            public_addr: host.to_string(),
            virtual_addr: Ipv4Addr::UNSPECIFIED,
            port: 22,
            public_key: None,
            state: NodeState::Online,
            last_seen: None,
            transports: vec![TransportKind::Ssh],
            load_score: None,
            latency: None,
            tags: Vec::new(),
            region: None,
            capabilities: BTreeMap::new(),
            is_local: false,
            user: None,
            password: None,
        }
    }

    fn setup() -> (Arc<NodeRegistry>, Arc<ScriptedProber>, HealthMonitor) {
        let registry = Arc::new(NodeRegistry::new("mesh0"));
        registry
            .initialize(AddressPool::new("10.99.0.0/24").unwrap(), node("local", "0.0.0.0"))
            .unwrap();
        let prober = Arc::new(ScriptedProber::default());
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            prober.clone() as Arc<dyn NodeProber>,
            Duration::from_secs(30),
        );
        (registry, prober, monitor)
    }

    #[tokio::test]
    async fn test_offline_then_recovered() {
        let (registry, prober, monitor) = setup();
        registry.insert_remote(|_| node("a", "198.51.100.1")).unwrap();
        let scope = CancellationToken::new();

        prober.set("198.51.100.1", Some(Duration::from_millis(20)));
        monitor.check_once(&scope).await;
        let first_seen = registry.get("a").unwrap().last_seen.unwrap();

        prober.set("198.51.100.1", None);
        let report = monitor.check_once(&scope).await;
        assert_eq!(report.offline, 1);
        assert_eq!(report.transitions[0].to, NodeState::Offline);
        let a = registry.get("a").unwrap();
        assert_eq!(a.state, NodeState::Offline);
        assert_eq!(a.last_seen, Some(first_seen));
        assert_eq!(a.latency, Some(Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(5)).await;
        prober.set("198.51.100.1", Some(Duration::from_millis(35)));
        let report = monitor.check_once(&scope).await;
        assert_eq!(report.transitions[0].to, NodeState::Online);
        let a = registry.get("a").unwrap();
        assert_eq!(a.state, NodeState::Online);
        assert!(a.last_seen.unwrap() > first_seen);
        assert_eq!(a.latency, Some(Duration::from_millis(35)));
    }

    #[tokio::test]
    async fn test_local_node_is_never_probed() {
        let (registry, _prober, monitor) = setup();
        let report = monitor.check_once(&CancellationToken::new()).await;
        assert_eq!(report.probed, 0);
        assert!(registry.local().unwrap().is_online());
    }

    #[tokio::test]
    async fn test_cancelled_scope_discards_results() {
        let (registry, _prober, monitor) = setup();
        registry.insert_remote(|_| node("a", "198.51.100.1")).unwrap();
        let scope = CancellationToken::new();
        scope.cancel();

        let report = monitor.check_once(&scope).await;
        assert_eq!(report, HealthReport::default());
        assert_eq!(registry.get("a").unwrap().state, NodeState::Online);
    }

    #[tokio::test]
    async fn test_concurrent_passes_do_not_overlap() {
        let registry = Arc::new(NodeRegistry::new("mesh0"));
        registry
            .initialize(AddressPool::new("10.99.0.0/24").unwrap(), node("local", "0.0.0.0"))
            .unwrap();
        registry.insert_remote(|_| node("a", "198.51.100.1")).unwrap();
        let prober = Arc::new(SlowProber::default());
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            prober.clone() as Arc<dyn NodeProber>,
            Duration::from_secs(30),
        );
        let scope = CancellationToken::new();

        let (first, second) = tokio::join!(monitor.check_once(&scope), monitor.check_once(&scope));
        assert_eq!(first.probed, 1);
        assert_eq!(second.probed, 1);
        assert_eq!(prober.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_registry, _prober, monitor) = setup();
        let scope = CancellationToken::new();
        let handle = {
            let scope = scope.clone();
            tokio::spawn(async move { monitor.run(scope).await })
        };
        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
