use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::mesh::error::{MeshError, MeshResult};

/// Sequential IPv4 allocator over a CIDR block.
///
/// The first host address belongs to the local node. Allocation is a linear
/// scan from the start of the block, so released addresses are handed out
/// again before higher ones. Not synchronized; the owning registry's lock
/// guards it.
#[derive(Debug, Clone)]
pub struct AddressPool {
    network: Ipv4Net,
    local: Ipv4Addr,
    allocated: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool from a CIDR string (e.g. "10.99.0.0/24").
    pub fn new(cidr: &str) -> MeshResult<Self> {
        let network: Ipv4Net = cidr.parse().map_err(|e: ipnet::AddrParseError| {
            MeshError::AddressBlockInvalid {
                block: cidr.to_string(),
                reason: e.to_string(),
            }
        })?;
        let network = network.trunc();

        let local = network
            .hosts()
            .next()
            .ok_or_else(|| MeshError::AddressBlockInvalid {
                block: cidr.to_string(),
                reason: "block contains no host addresses".to_string(),
            })?;

        Ok(AddressPool {
            network,
            local,
            allocated: BTreeSet::new(),
        })
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Address reserved for the local node.
    pub fn local_address(&self) -> Ipv4Addr {
        self.local
    }

    /// Marks the local address as taken and returns it.
    pub fn reserve_local(&mut self) -> Ipv4Addr {
        self.allocated.insert(self.local);
        self.local
    }

    /// Next free address after the reserved local one.
    pub fn allocate(&mut self) -> MeshResult<Ipv4Addr> {
        let addr = self
            .network
            .hosts()
            .filter(|addr| *addr != self.local)
            .find(|addr| !self.allocated.contains(addr))
            .ok_or_else(|| MeshError::AddressExhausted(self.network.to_string()))?;
        self.allocated.insert(addr);
        Ok(addr)
    }

    /// Marks a specific address as taken. Returns false if it is outside the
    /// block or already taken.
    pub fn claim(&mut self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr) && self.allocated.insert(addr)
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        if addr == self.local {
            tracing::warn!(%addr, "Refusing to release the local node address");
            return;
        }
        if !self.allocated.remove(&addr) {
            tracing::warn!(%addr, "Attempted to release an address that is not allocated");
        }
    }

    /// Host addresses available to remote nodes.
    pub fn capacity(&self) -> usize {
        self.network.hosts().count().saturating_sub(1)
    }
}
