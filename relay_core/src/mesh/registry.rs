//! Node inventory and virtual address space.
//!
//! Every mutation of a node, the address pool or the route table goes through
//! the registry's single lock. Readers get copies.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::ipam::AddressPool;
use crate::mesh::types::{MeshNode, NodeState, Route};

const ROUTE_METRIC: u32 = 100;
const ROUTE_PROTOCOL: &str = "mesh";

/// A state change caused by a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTransition {
    pub id: String,
    pub name: String,
    pub from: NodeState,
    pub to: NodeState,
}

#[derive(Default)]
struct RegistryState {
    pool: Option<AddressPool>,
    nodes: HashMap<String, MeshNode>,
    /// Insertion order, local node first.
    order: Vec<String>,
    local_id: Option<String>,
    routes: BTreeMap<String, Route>,
}

impl RegistryState {
    fn pool_mut(&mut self) -> MeshResult<&mut AddressPool> {
        self.pool.as_mut().ok_or(MeshError::NotInitialized)
    }
}

fn route_for(node: &MeshNode, interface: &str) -> Route {
    Route {
        destination: Ipv4Net::from(node.virtual_addr),
        gateway: node.virtual_addr,
        interface: interface.to_string(),
        metric: ROUTE_METRIC,
        protocol: ROUTE_PROTOCOL.to_string(),
    }
}

pub struct NodeRegistry {
    interface: String,
    state: RwLock<RegistryState>,
}

impl NodeRegistry {
    pub fn new(interface: impl Into<String>) -> Self {
        NodeRegistry {
            interface: interface.into(),
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().pool.is_some()
    }

    pub fn network(&self) -> Option<Ipv4Net> {
        self.read().pool.as_ref().map(AddressPool::network)
    }

    /// Installs the address pool and registers `local` on the reserved first
    /// address.
    pub fn initialize(&self, mut pool: AddressPool, mut local: MeshNode) -> MeshResult<MeshNode> {
        let mut state = self.write();
        if state.pool.is_some() {
            return Err(MeshError::AlreadyInitialized);
        }

        local.virtual_addr = pool.reserve_local();
        local.is_local = true;
        info!(
            node_id = %local.id,
            virtual_addr = %local.virtual_addr,
            "Assigned local node address"
        );

        state.pool = Some(pool);
        state.local_id = Some(local.id.clone());
        state.order.push(local.id.clone());
        state.nodes.insert(local.id.clone(), local.clone());
        Ok(local)
    }

    /// Re-registers persisted nodes, re-claiming their addresses.
    pub fn restore(&self, pool: AddressPool, nodes: Vec<MeshNode>) -> MeshResult<()> {
        let mut guard = self.write();
        if guard.pool.is_some() {
            return Err(MeshError::AlreadyInitialized);
        }
        let mut pool = pool;
        let mut state = RegistryState::default();

        for node in nodes {
            if node.is_local {
                if node.virtual_addr != pool.local_address() {
                    warn!(
                        node_id = %node.id,
                        "Persisted local address differs from the block's first host"
                    );
                }
                pool.claim(node.virtual_addr);
                state.local_id = Some(node.id.clone());
            } else if !pool.claim(node.virtual_addr) {
                warn!(
                    node_id = %node.id,
                    virtual_addr = %node.virtual_addr,
                    "Skipping persisted node with unusable address"
                );
                continue;
            } else {
                let route = route_for(&node, &self.interface);
                state.routes.insert(node.id.clone(), route);
            }
            state.order.push(node.id.clone());
            state.nodes.insert(node.id.clone(), node);
        }

        if state.local_id.is_none() {
            return Err(MeshError::NotInitialized);
        }
        state.pool = Some(pool);
        *guard = state;
        Ok(())
    }

    /// Allocates the next free address and registers the node built from it
    /// as one step, together with its route.
    pub fn insert_remote<F>(&self, build: F) -> MeshResult<MeshNode>
    where
        F: FnOnce(Ipv4Addr) -> MeshNode,
    {
        let mut state = self.write();
        let addr = state.pool_mut()?.allocate()?;
        let mut node = build(addr);
        node.virtual_addr = addr;
        node.is_local = false;

        if state
            .nodes
            .values()
            .any(|n| !n.is_local && n.public_addr == node.public_addr && n.port == node.port)
        {
            state.pool_mut()?.release(addr);
            return Err(MeshError::Duplicate(format!("{}:{}", node.public_addr, node.port)));
        }

        let route = route_for(&node, &self.interface);
        state.routes.insert(node.id.clone(), route);
        state.order.push(node.id.clone());
        state.nodes.insert(node.id.clone(), node.clone());
        info!(
            node_id = %node.id,
            name = %node.name,
            virtual_addr = %addr,
            state = %node.state,
            "Registered node"
        );
        Ok(node)
    }

    /// Administrative removal. Frees the node's address and route.
    pub fn remove(&self, id: &str) -> MeshResult<MeshNode> {
        let mut state = self.write();
        if state.local_id.as_deref() == Some(id) {
            return Err(MeshError::LocalNode);
        }
        let node = state
            .nodes
            .remove(id)
            .ok_or_else(|| MeshError::NotFound(id.to_string()))?;
        state.order.retain(|n| n != id);
        state.routes.remove(id);
        state.pool_mut()?.release(node.virtual_addr);
        info!(node_id = %id, virtual_addr = %node.virtual_addr, "Removed node");
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Option<MeshNode> {
        self.read().nodes.get(id).cloned()
    }

    pub fn local(&self) -> Option<MeshNode> {
        let state = self.read();
        state.local_id.as_ref().and_then(|id| state.nodes.get(id)).cloned()
    }

    /// Copies of every node in registration order.
    pub fn snapshot(&self) -> Vec<MeshNode> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .cloned()
            .collect()
    }

    /// Copies of the non-local nodes in registration order.
    pub fn remotes(&self) -> Vec<MeshNode> {
        self.snapshot().into_iter().filter(|n| !n.is_local).collect()
    }

    pub fn contains_endpoint(&self, host: &str, port: u16) -> bool {
        self.read()
            .nodes
            .values()
            .any(|n| !n.is_local && n.public_addr == host && n.port == port)
    }

    /// Applies one probe outcome. Success refreshes latency and `last_seen`;
    /// failure only flips the state, leaving the last latency in place.
    pub fn apply_probe(
        &self,
        id: &str,
        outcome: Result<Duration, String>,
        at: DateTime<Utc>,
    ) -> Option<NodeTransition> {
        let mut state = self.write();
        let node = state.nodes.get_mut(id)?;
        let from = node.state;

        match outcome {
            Ok(latency) => {
                node.state = NodeState::Online;
                node.latency = Some(latency);
                node.last_seen = Some(at);
            }
            Err(reason) => {
                debug!(node_id = %id, error = %reason, "Probe failed");
                node.state = NodeState::Offline;
            }
        }

        (from != node.state).then(|| NodeTransition {
            id: node.id.clone(),
            name: node.name.clone(),
            from,
            to: node.state,
        })
    }

    /// Records a load score, clamped to [0, 1]. `None` clears it.
    pub fn set_load(&self, id: &str, load: Option<f64>) -> bool {
        let mut state = self.write();
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.load_score = load.filter(|l| l.is_finite()).map(|l| l.clamp(0.0, 1.0));
                true
            }
            None => false,
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.routes.get(id))
            .cloned()
            .collect()
    }

    /// Brings the route table back to exactly one route per remote node.
    /// Returns the number of routes added, replaced or dropped.
    pub fn reconcile_routes(&self) -> usize {
        let mut guard = self.write();
        let state = &mut *guard;
        let mut changes = 0;

        let before = state.routes.len();
        state
            .routes
            .retain(|id, _| state.nodes.get(id).is_some_and(|n| !n.is_local));
        changes += before - state.routes.len();

        for node in state.nodes.values().filter(|n| !n.is_local) {
            let wanted = route_for(node, &self.interface);
            if state.routes.get(&node.id) != Some(&wanted) {
                state.routes.insert(node.id.clone(), wanted);
                changes += 1;
            }
        }
        changes
    }
}
