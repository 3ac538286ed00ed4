//! Human readable output.

use relay_core::mesh::{MeshNode, MeshSession, MeshStatus};
use relay_core::tunnel::{TunnelEvent, TunnelState, TunnelStatus};
use relay_core::AppConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub fn latency(latency: Option<Duration>) -> String {
    match latency {
        Some(d) => format!("{}ms", d.as_millis()),
        None => "-".to_string(),
    }
}

fn state_marker(online: bool) -> &'static str {
    if online {
        "[up]  "
    } else {
        "[down]"
    }
}

pub fn node_line(node: &MeshNode) -> String {
    let mut line = format!(
        "{} {} {} ({}) {} {}",
        state_marker(node.is_online()),
        node.id,
        node.name,
        node.virtual_addr,
        node.state,
        latency(node.latency),
    );
    if node.is_local {
        line.push_str(" local");
    }
    if let Some(region) = &node.region {
        line.push_str(&format!(" region={region}"));
    }
    if !node.tags.is_empty() {
        line.push_str(&format!(" tags={}", node.tags.join(",")));
    }
    line
}

pub fn mesh_initialized(local: &MeshNode, state_path: &Path) {
    println!("Mesh initialized");
    println!("  local node: {} ({})", local.name, local.virtual_addr);
    println!("  node id:    {}", local.id);
    println!("  state file: {}", state_path.display());
    println!("Add servers with: meshrelay mesh add <host> <user>");
}

pub fn mesh_node_added(node: &MeshNode) {
    println!("Added {}", node_line(node));
}

pub fn mesh_status(status: &MeshStatus) {
    println!("Mesh network {}", status.address_block);
    println!("  load balancing: {}", status.load_balancing);
    println!(
        "  nodes: {} total, {} online, {} offline",
        status.total_nodes, status.online_nodes, status.offline_nodes
    );
    println!();
    for node in &status.nodes {
        println!("  {}", node_line(node));
    }
    if !status.routes.is_empty() {
        println!();
        println!("Routes:");
        for route in &status.routes {
            println!(
                "  {} via {} dev {} metric {}",
                route.destination, route.gateway, route.interface, route.metric
            );
        }
    }
}

pub fn mesh_connected(node: &MeshNode, session: &MeshSession) {
    println!(
        "Connected to {} ({}) over {} at {}, latency {}",
        node.name,
        session.virtual_addr,
        session.transport,
        session.remote,
        latency(session.latency)
    );
}

pub fn quick_setup_done(path: &Path, config: &AppConfig) {
    println!("Discovered {} server records:", config.servers.len());
    for server in &config.servers {
        let enabled = if server.enabled { "" } else { " (disabled)" };
        println!(
            "  {} {}:{} {}{}",
            server.name, server.host, server.port_or_default(), server.transport, enabled
        );
    }
    println!("Configuration written to {}", path.display());
    println!("Start it with: meshrelay config {}", path.display());
}

pub fn server_banner(host: &str, port: u16, config: &AppConfig) {
    println!("Management API on http://{host}:{port}/api/v1");
    println!("  GET  /api/v1/health        health check");
    println!("  GET  /api/v1/status        tunnel status");
    println!("  POST /api/v1/tunnels/start start a tunnel");
    println!("  POST /api/v1/tunnels/stop  stop tunnels");
    if config.security.enable_auth {
        println!("Bearer token required except for /health");
    }
}

pub fn tunnel_event(event: &TunnelEvent) {
    let at = event.at.format("%H:%M:%S");
    match (&event.state, &event.error) {
        (TunnelState::Error, Some(error)) => println!("{at} {} error: {error}", event.name),
        (state, _) => println!("{at} {} {state}", event.name),
    }
}

pub fn tunnel_table(status: &BTreeMap<String, TunnelStatus>) {
    println!(
        "{:<20} {:<15} {:<13} {:>8} {:>12} {:>12}",
        "TUNNEL", "TRANSPORT", "STATE", "LATENCY", "SENT", "RECEIVED"
    );
    for tunnel in status.values() {
        println!(
            "{:<20} {:<15} {:<13} {:>8} {:>12} {:>12}",
            tunnel.name,
            tunnel.transport.as_str(),
            tunnel.state.as_str(),
            latency(tunnel.latency),
            tunnel.bytes_sent,
            tunnel.bytes_received
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::mesh::NodeState;
    use std::net::Ipv4Addr;

    fn node() -> MeshNode {
        MeshNode {
            id: "n1".into(),
            name: "relay-1".into(),
            public_addr: "203.0.113.7".into(),
            virtual_addr: Ipv4Addr::new(10, 99, 0, 2),
            port: 22,
            public_key: None,
            state: NodeState::Online,
            last_seen: None,
            transports: Vec::new(),
            load_score: None,
            latency: Some(Duration::from_millis(25)),
            tags: vec!["edge".into(), "fast".into()],
            region: Some("eu".into()),
            capabilities: Default::default(),
            is_local: false,
            user: None,
            password: None,
        }
    }

    #[test]
    fn test_latency_format() {
        assert_eq!(latency(Some(Duration::from_millis(42))), "42ms");
        assert_eq!(latency(None), "-");
    }

    #[test]
    fn test_node_line() {
        assert_eq!(
            node_line(&node()),
            "[up]   n1 relay-1 (10.99.0.2) online 25ms region=eu tags=edge,fast"
        );

        let mut offline = node();
        offline.state = NodeState::Offline;
        offline.latency = None;
        offline.tags.clear();
        offline.region = None;
        assert_eq!(node_line(&offline), "[down] n1 relay-1 (10.99.0.2) offline -");
    }
}
