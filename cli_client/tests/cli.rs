//! Runs the meshrelay binary end to end.

use std::path::Path;
use std::process::{Command, Output};

fn meshrelay(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_meshrelay"))
        .args(args)
        .env_remove("MESHRELAY_MESH_STATE")
        .env_remove("MESHRELAY_CONFIG")
        .env_remove("CONFIG_PASSWORD")
        .output()
        .expect("failed to run meshrelay")
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp path is not UTF-8")
}

#[test]
fn test_mesh_init_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("mesh-state.json");

    let init = meshrelay(&["mesh", "init", "10.66.0.0/24", "--state", path_arg(&state)]);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    assert!(String::from_utf8_lossy(&init.stdout).contains("10.66.0.1"));
    assert!(state.exists());

    let status = meshrelay(&["mesh", "status", "--json", "--state", path_arg(&state)]);
    assert!(status.status.success());
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(json["address_block"], "10.66.0.0/24");
    assert_eq!(json["total_nodes"], 1);
    assert_eq!(json["local_node"]["virtual_addr"], "10.66.0.1");

    let again = meshrelay(&["mesh", "init", "--state", path_arg(&state)]);
    assert_eq!(again.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&again.stderr).contains("error: Mesh state already exists"));
}

#[test]
fn test_mesh_without_state_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("absent.json");

    let output = meshrelay(&["mesh", "status", "--state", path_arg(&state)]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: No mesh state"), "{stderr}");
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let output = meshrelay(&["config", path_arg(&missing)]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error: Configuration error"));
}

#[test]
fn test_invalid_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("mesh-state.json");

    let output = meshrelay(&["mesh", "init", "10.66.0.0/40", "--state", path_arg(&state)]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!state.exists());
}
