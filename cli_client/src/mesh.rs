//! `meshrelay mesh` commands.
//!
//! Every invocation rebuilds the overlay from the state file, applies one
//! change and writes the state back.

use relay_core::mesh::{MeshNode, MeshSession, MeshState, MeshStatus, NodeSpec};
use relay_core::{AppConfig, MeshConfig, MeshError, MeshOverlay};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cli::{CliError, CliResult, MeshArgs, MeshCommand};
use crate::render;

/// Which node `connect` should pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Best,
    Node(String),
    Region(String),
    Tag(String),
}

pub async fn run(args: MeshArgs) -> CliResult<()> {
    let state_path = args.state.unwrap_or_else(MeshState::default_path);

    match args.action {
        MeshCommand::Init { block } => {
            let config = seed_config(args.config.as_deref(), block)?;
            let local = init(&state_path, config).await?;
            render::mesh_initialized(&local, &state_path);
        }
        MeshCommand::Add {
            host,
            user,
            password,
            port,
            name,
            tags,
            region,
        } => {
            let mut spec = NodeSpec::new(host, port).with_tags(tags);
            spec.user = Some(user);
            spec.password = password;
            spec.name = name;
            spec.region = region;
            let node = add(&state_path, spec).await?;
            render::mesh_node_added(&node);
        }
        MeshCommand::Status { check, json } => {
            let status = status(&state_path, check).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status).map_err(MeshError::from)?);
            } else {
                render::mesh_status(&status);
            }
        }
        MeshCommand::Connect { node, region, tag } => {
            let target = match (node, region, tag) {
                (Some(id), _, _) => ConnectTarget::Node(id),
                (None, Some(region), _) => ConnectTarget::Region(region),
                (None, None, Some(tag)) => ConnectTarget::Tag(tag),
                (None, None, None) => ConnectTarget::Best,
            };
            let (node, session) = connect(&state_path, target).await?;
            render::mesh_connected(&node, &session);
        }
        MeshCommand::Remove { node } => {
            let removed = remove(&state_path, &node)?;
            println!("Removed {} ({})", removed.name, removed.virtual_addr);
        }
    }
    Ok(())
}

/// Mesh settings for `init`: the [mesh] section of `config_path` when given,
/// with `block` overriding its address block.
pub fn seed_config(config_path: Option<&Path>, block: Option<String>) -> CliResult<MeshConfig> {
    let mut config = match config_path {
        Some(path) => AppConfig::load(path)?.mesh,
        None => MeshConfig::default(),
    };
    if let Some(block) = block {
        config.address_block = block;
    }
    config.validate()?;
    Ok(config)
}

pub async fn init(state_path: &Path, config: MeshConfig) -> CliResult<MeshNode> {
    if state_path.exists() {
        return Err(CliError::MeshExists(state_path.to_path_buf()));
    }

    let overlay = MeshOverlay::new(config);
    let local = overlay.initialize().await?;
    let saved = save(&overlay, state_path);
    overlay.shutdown().await;
    saved?;

    info!(path = %state_path.display(), "Mesh initialized");
    Ok(local)
}

pub async fn add(state_path: &Path, spec: NodeSpec) -> CliResult<MeshNode> {
    let overlay = open(state_path)?;
    let node = overlay.add_server(spec).await?;
    save(&overlay, state_path)?;
    Ok(node)
}

/// Status after an optional health pass. A health pass is persisted.
pub async fn status(state_path: &Path, check: bool) -> CliResult<MeshStatus> {
    let overlay = open(state_path)?;
    if check {
        let report = overlay.check_health().await;
        debug!(probed = report.probed, online = report.online, "Health check finished");
        save(&overlay, state_path)?;
    }
    Ok(overlay.status())
}

/// Refreshes node health, picks a node for `target` and connects to it.
pub async fn connect(
    state_path: &Path,
    target: ConnectTarget,
) -> CliResult<(MeshNode, MeshSession)> {
    let overlay = open(state_path)?;
    overlay.check_health().await;
    save(&overlay, state_path)?;

    let node = match target {
        ConnectTarget::Best => overlay.get_best_node(None)?,
        ConnectTarget::Region(region) => {
            if overlay.nodes_by_region(&region).is_empty() {
                return Err(MeshError::NoAvailableNodes.into());
            }
            overlay.get_best_node(Some(&region))?
        }
        ConnectTarget::Tag(tag) => {
            let tagged = overlay.nodes_by_tag(&tag);
            if tagged.is_empty() {
                return Err(MeshError::NoAvailableNodes.into());
            }
            relay_core::mesh::selector::best_node(&tagged, None)?
        }
        ConnectTarget::Node(id) => overlay
            .node(&id)
            .ok_or(MeshError::NotFound(id))?,
    };

    let session = overlay.connect_to_node(&node.id, None).await?;
    Ok((node, session))
}

pub fn remove(state_path: &Path, id: &str) -> CliResult<MeshNode> {
    let overlay = open(state_path)?;
    let removed = overlay.remove_node(id)?;
    save(&overlay, state_path)?;
    Ok(removed)
}

fn open(state_path: &Path) -> CliResult<MeshOverlay> {
    if !state_path.exists() {
        return Err(CliError::MeshMissing(PathBuf::from(state_path)));
    }
    let state = MeshState::load(state_path)?;
    let overlay = MeshOverlay::new(state.config.clone());
    overlay.restore(state)?;
    Ok(overlay)
}

fn save(overlay: &MeshOverlay, state_path: &Path) -> CliResult<()> {
    overlay.to_state().save(state_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::mesh::NodeState;
    use tokio::net::TcpListener;

    fn block_config() -> MeshConfig {
        MeshConfig::default().with_address_block("10.77.0.0/24")
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_init_then_reinit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");

        let local = init(&path, block_config()).await.unwrap();
        assert!(local.is_local);
        assert_eq!(local.virtual_addr.to_string(), "10.77.0.1");
        assert!(path.exists());

        assert!(matches!(
            init(&path, block_config()).await,
            Err(CliError::MeshExists(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_need_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(
            status(&path, false).await,
            Err(CliError::MeshMissing(p)) if p == path
        ));
        assert!(matches!(remove(&path, "x"), Err(CliError::MeshMissing(_))));
    }

    #[tokio::test]
    async fn test_add_status_remove_persist_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        init(&path, block_config()).await.unwrap();

        let (_server, port) = listener().await;
        let spec = NodeSpec::new("127.0.0.1", port)
            .with_name("relay-1")
            .with_region("eu");
        let node = add(&path, spec).await.unwrap();
        assert_eq!(node.virtual_addr.to_string(), "10.77.0.2");
        assert_eq!(node.state, NodeState::Online);

        let snapshot = status(&path, false).await.unwrap();
        assert_eq!(snapshot.total_nodes, 2);
        assert_eq!(snapshot.routes.len(), 1);
        assert_eq!(snapshot.address_block, "10.77.0.0/24");

        let removed = remove(&path, &node.id).unwrap();
        assert_eq!(removed.name, "relay-1");
        assert_eq!(status(&path, false).await.unwrap().total_nodes, 1);
    }

    #[tokio::test]
    async fn test_status_masks_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        init(&path, block_config()).await.unwrap();

        let (_server, port) = listener().await;
        let mut spec = NodeSpec::new("127.0.0.1", port);
        spec.user = Some("root".into());
        spec.password = Some("hunter2".into());
        add(&path, spec).await.unwrap();

        let snapshot = status(&path, false).await.unwrap();
        let remote = snapshot.nodes.iter().find(|n| !n.is_local).unwrap();
        assert_eq!(remote.password.as_deref(), Some("********"));

        // The state file keeps the real credential for later connects
        let state = MeshState::load(&path).unwrap();
        let stored = state.nodes.iter().find(|n| !n.is_local).unwrap();
        assert_eq!(stored.password.as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_connect_by_id_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        init(&path, block_config()).await.unwrap();

        let (_server, port) = listener().await;
        let node = add(&path, NodeSpec::new("127.0.0.1", port).with_tags(["edge"]))
            .await
            .unwrap();

        let (picked, session) = connect(&path, ConnectTarget::Best).await.unwrap();
        assert_eq!(picked.id, node.id);
        assert_eq!(session.node_id, node.id);
        assert_eq!(session.virtual_addr, node.virtual_addr);

        let (picked, _) = connect(&path, ConnectTarget::Node(node.id.clone())).await.unwrap();
        assert_eq!(picked.id, node.id);

        let (picked, _) = connect(&path, ConnectTarget::Tag("edge".into())).await.unwrap();
        assert_eq!(picked.id, node.id);
    }

    #[tokio::test]
    async fn test_connect_without_matching_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        init(&path, block_config()).await.unwrap();

        assert!(matches!(
            connect(&path, ConnectTarget::Best).await,
            Err(CliError::Mesh(MeshError::NoAvailableNodes))
        ));
        assert!(matches!(
            connect(&path, ConnectTarget::Tag("nope".into())).await,
            Err(CliError::Mesh(MeshError::NoAvailableNodes))
        ));
        assert!(matches!(
            connect(&path, ConnectTarget::Node("ghost".into())).await,
            Err(CliError::Mesh(MeshError::NotFound(_)))
        ));
    }

    #[test]
    fn test_seed_config_block_override() {
        let config = seed_config(None, Some("10.5.0.0/16".into())).unwrap();
        assert_eq!(config.address_block, "10.5.0.0/16");

        assert!(matches!(
            seed_config(None, Some("10.5.0.0/40".into())),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_seed_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[servers]]
name = "home"
host = "203.0.113.10"
port = 22
user = "root"
password = "pw"

[mesh]
address_block = "10.8.0.0/24"
local_node_name = "laptop"
"#,
        )
        .unwrap();

        let config = seed_config(Some(&path), None).unwrap();
        assert_eq!(config.address_block, "10.8.0.0/24");
        assert_eq!(config.local_node_name, "laptop");
    }
}
