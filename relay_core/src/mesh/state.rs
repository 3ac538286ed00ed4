//! On-disk mesh state shared between separate CLI invocations.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{write_private, AppConfig};
use crate::mesh::error::MeshResult;
use crate::mesh::types::{MeshConfig, MeshNode};

pub const STATE_FILE: &str = "mesh-state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshState {
    pub config: MeshConfig,
    /// Base64 x25519 private key of the local node
    pub local_private_key: Option<String>,
    pub nodes: Vec<MeshNode>,
}

impl MeshState {
    pub fn default_path() -> PathBuf {
        AppConfig::config_dir().join(STATE_FILE)
    }

    pub fn load(path: &Path) -> MeshResult<Self> {
        let content = fs::read_to_string(path)?;
        let state: MeshState = serde_json::from_str(&content)?;
        debug!(path = %path.display(), nodes = state.nodes.len(), "Loaded mesh state");
        Ok(state)
    }

    /// Writes the state with owner-only permissions.
    pub fn save(&self, path: &Path) -> MeshResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_private(path, &json)?;
        debug!(path = %path.display(), nodes = self.nodes.len(), "Saved mesh state");
        Ok(())
    }
}
