//! Node ranking and load-balancing policies.
//!
//! Everything here works on registry snapshots and never mutates nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::types::{LoadBalancing, MeshNode};

pub const LATENCY_WEIGHT: f64 = 0.4;
pub const LOAD_WEIGHT: f64 = 0.3;
pub const ONLINE_BONUS: f64 = 100.0;
pub const REGION_BONUS: f64 = 50.0;

/// `1000 / (ms + 1)`; a node that was never measured scores 0.
pub fn latency_score(latency: Option<Duration>) -> f64 {
    latency.map_or(0.0, |l| 1000.0 / (l.as_millis() as f64 + 1.0))
}

/// Weighted rank of a node. Higher is better. A missing load score counts as idle.
pub fn score(node: &MeshNode, region: Option<&str>) -> f64 {
    let load = node.load_score.unwrap_or(0.0);
    let mut score = LATENCY_WEIGHT * latency_score(node.latency) + LOAD_WEIGHT * (1.0 - load);
    if node.is_online() {
        score += ONLINE_BONUS;
    }
    if region.is_some_and(|r| !r.is_empty() && node.in_region(r)) {
        score += REGION_BONUS;
    }
    score
}

/// Highest-scoring online remote node. The first of equal scores wins, so the
/// result only depends on the snapshot.
pub fn best_node(nodes: &[MeshNode], region: Option<&str>) -> MeshResult<MeshNode> {
    let mut best: Option<(&MeshNode, f64)> = None;
    for node in nodes.iter().filter(|n| !n.is_local && n.is_online()) {
        let s = score(node, region);
        if best.is_none_or(|(_, current)| s > current) {
            best = Some((node, s));
        }
    }
    best.map(|(node, _)| node.clone())
        .ok_or(MeshError::NoAvailableNodes)
}

/// Online remote nodes.
pub fn healthy(nodes: &[MeshNode]) -> Vec<MeshNode> {
    nodes
        .iter()
        .filter(|n| !n.is_local && n.is_online())
        .cloned()
        .collect()
}

pub fn by_region(nodes: &[MeshNode], region: &str) -> Vec<MeshNode> {
    nodes
        .iter()
        .filter(|n| !n.is_local && n.is_online() && n.in_region(region))
        .cloned()
        .collect()
}

pub fn by_tag(nodes: &[MeshNode], tag: &str) -> Vec<MeshNode> {
    nodes
        .iter()
        .filter(|n| !n.is_local && n.is_online() && n.has_tag(tag))
        .cloned()
        .collect()
}

/// Applies one [`LoadBalancing`] policy over a healthy node set.
#[derive(Debug, Default)]
pub struct NodeSelector {
    policy: LoadBalancing,
    cursor: AtomicUsize,
}

impl NodeSelector {
    pub fn new(policy: LoadBalancing) -> Self {
        NodeSelector {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> LoadBalancing {
        self.policy
    }

    pub fn select(&self, healthy: &[MeshNode]) -> MeshResult<MeshNode> {
        if healthy.is_empty() {
            return Err(MeshError::NoHealthyNodes);
        }
        let node = match self.policy {
            LoadBalancing::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                &healthy[turn % healthy.len()]
            }
            LoadBalancing::LeastConnections => {
                least_loaded(healthy).unwrap_or_else(|| lowest_latency(healthy))
            }
            LoadBalancing::Latency => lowest_latency(healthy),
        };
        Ok(node.clone())
    }
}

/// `None` when no node has reported a load score.
fn least_loaded(nodes: &[MeshNode]) -> Option<&MeshNode> {
    let mut best: Option<(&MeshNode, f64)> = None;
    for node in nodes {
        let Some(load) = node.load_score else { continue };
        if best.is_none_or(|(_, current)| load < current) {
            best = Some((node, load));
        }
    }
    best.map(|(node, _)| node)
}

/// Unmeasured nodes rank last; the first node wins when nothing is measured.
fn lowest_latency(nodes: &[MeshNode]) -> &MeshNode {
    let mut best = &nodes[0];
    for node in &nodes[1..] {
        let better = match (node.latency, best.latency) {
            (Some(candidate), Some(current)) => candidate < current,
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best = node;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::mesh::types::NodeState;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn node(id: &str, ms: Option<u64>, load: Option<f64>) -> MeshNode {
        MeshNode {
            id: id.to_string(),
            name: id.to_string(),
            public_addr: format!("{id}.example.net"),
            virtual_addr: Ipv4Addr::UNSPECIFIED,
            port: 22,
            public_key: None,
            state: NodeState::Online,
            last_seen: None,
            transports: vec![TransportKind::Ssh],
            load_score: load,
            latency: ms.map(Duration::from_millis),
            tags: Vec::new(),
            region: None,
            capabilities: BTreeMap::new(),
            is_local: false,
            user: None,
            password: None,
        }
    }

    #[test]
    fn test_score_formula() {
        let mut n = node("a", Some(9), Some(0.5));
        // 0.4 * 1000/10 + 0.3 * 0.5 + 100
        assert!((score(&n, None) - 140.15).abs() < 1e-9);
        n.region = Some("eu".into());
        assert!((score(&n, Some("eu")) - 190.15).abs() < 1e-9);
        assert_eq!(latency_score(None), 0.0);
    }

    #[test]
    fn test_best_node_skips_local_and_offline() {
        let mut local = node("local", Some(0), None);
        local.is_local = true;
        let mut offline = node("off", Some(1), None);
        offline.state = NodeState::Offline;
        let slow = node("slow", Some(200), None);
        let fast = node("fast", Some(20), None);

        let nodes = vec![local, offline, slow, fast];
        assert_eq!(best_node(&nodes, None).unwrap().id, "fast");
        assert_eq!(best_node(&nodes, None).unwrap().id, best_node(&nodes, None).unwrap().id);
        assert!(matches!(best_node(&nodes[..2], None), Err(MeshError::NoAvailableNodes)));
    }

    #[test]
    fn test_best_node_ties_go_to_first() {
        let nodes = vec![node("first", Some(10), None), node("second", Some(10), None)];
        assert_eq!(best_node(&nodes, None).unwrap().id, "first");
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = NodeSelector::new(LoadBalancing::RoundRobin);
        let nodes = vec![node("a", None, None), node("b", None, None), node("c", None, None)];
        let picks: Vec<String> = (0..4).map(|_| selector.select(&nodes).unwrap().id).collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[test]
    fn test_least_connections_falls_back_to_latency() {
        let selector = NodeSelector::new(LoadBalancing::LeastConnections);
        let nodes = vec![node("a", Some(50), None), node("b", Some(10), None)];
        assert_eq!(selector.select(&nodes).unwrap().id, "b");

        let nodes = vec![node("a", Some(50), Some(0.2)), node("b", Some(10), Some(0.9))];
        assert_eq!(selector.select(&nodes).unwrap().id, "a");
    }

    #[test]
    fn test_latency_policy_prefers_measured_nodes() {
        let selector = NodeSelector::new(LoadBalancing::Latency);
        let nodes = vec![node("a", None, None), node("b", Some(70), None)];
        assert_eq!(selector.select(&nodes).unwrap().id, "b");
    }

    #[test]
    fn test_empty_healthy_set() {
        for policy in [
            LoadBalancing::RoundRobin,
            LoadBalancing::LeastConnections,
            LoadBalancing::Latency,
        ] {
            assert!(matches!(
                NodeSelector::new(policy).select(&[]),
                Err(MeshError::NoHealthyNodes)
            ));
        }
    }
}
