use relay_core::config::{
    AppConfig, ConfigError, ConfigManager, RuleAction, RuleKind, TransportKind,
};
use relay_core::tunnel::{OrchestratorSettings, SelectionMethod};
use std::io::Write;
use tempfile::NamedTempFile;

const FULL: &str = r#"
    version = "1.0"
    auto_select = true
    selection_method = "random"
    enable_failover = true
    failover_timeout_secs = 15

    [[servers]]
    name = "home"
    host = "198.51.100.7"
    port = 22
    user = "admin"
    password = "hunter2"
    priority = 1
    tags = ["home", "gaming"]
    region = "eu"

    [[servers]]
    name = "edge"
    host = "edge.example.net"
    port = 443
    transport = "trojan"
    tls_camouflage = { uuid = "6a1f0f4e-1d2b-4a55-9d53-2f1c0f1c9a11" }

    [[routing]]
    type = "domain"
    pattern = "*.example.org"
    action = "proxy"
    server = "edge"

    [[routing]]
    type = "ip"
    pattern = "10.0.0.0/8"
    action = "direct"

    [api]
    enabled = true
    port = 9000

    [mesh]
    address_block = "10.42.0.0/24"
    local_node_name = "laptop"
    load_balancing = "round-robin"
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_document() {
    let file = write_config(FULL);
    let config = AppConfig::load_with_passphrase(file.path(), None).unwrap();

    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[0].tags, vec!["home", "gaming"]);
    assert_eq!(config.servers[0].region.as_deref(), Some("eu"));
    assert_eq!(config.servers[1].transport, TransportKind::TlsCamouflage);
    assert_eq!(config.servers[1].local_port, 8081);

    assert_eq!(config.routing.len(), 2);
    assert_eq!(config.routing[0].kind, RuleKind::Domain);
    assert_eq!(config.routing[0].action, RuleAction::Proxy);
    assert_eq!(config.routing[1].server, None);

    assert!(config.api.enabled);
    assert_eq!(config.api.port, 9000);
    assert_eq!(config.mesh.address_block, "10.42.0.0/24");
    assert_eq!(config.mesh.local_node_name, "laptop");
}

#[test]
fn test_orchestrator_settings_follow_config() {
    let file = write_config(FULL);
    let config = AppConfig::load_with_passphrase(file.path(), None).unwrap();

    let settings = OrchestratorSettings::from_config(&config);
    assert!(settings.auto_select);
    assert_eq!(settings.selection_method, SelectionMethod::Random);
}

#[test]
fn test_routing_rule_must_name_known_server() {
    let file = write_config(&FULL.replace("server = \"edge\"", "server = \"nowhere\""));
    let err = AppConfig::load_with_passphrase(file.path(), None).unwrap_err();
    assert!(err.is_validation(), "unexpected error: {err}");
}

#[test]
fn test_invalid_mesh_block_is_rejected_at_load() {
    let file = write_config(&FULL.replace("10.42.0.0/24", "10.42.0.0/40"));
    let err = AppConfig::load_with_passphrase(file.path(), None).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[test]
fn test_malformed_toml() {
    let file = write_config("servers = [ { host = ");
    let err = AppConfig::load_with_passphrase(file.path(), None).unwrap_err();
    assert!(matches!(err, ConfigError::TomlError(_)));
}

#[test]
fn test_sealed_file_needs_the_right_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sealed.toml");

    let mut config = AppConfig::parse(FULL).unwrap();
    config.security.encrypt_config = true;
    config.save_with_passphrase(&path, Some("open sesame")).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("hunter2"));

    let err = AppConfig::load_with_passphrase(&path, Some("wrong")).unwrap_err();
    assert!(matches!(err, ConfigError::Decryption(_)));

    let loaded = AppConfig::load_with_passphrase(&path, Some("open sesame")).unwrap();
    assert_eq!(loaded.servers, config.servers);
}

#[test]
fn test_manager_saves_and_reloads_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL).unwrap();

    let mut manager = ConfigManager::load(&path).unwrap();
    manager.config_mut().servers.retain(|s| s.name != "edge");
    manager.config_mut().routing.clear();
    manager.save().unwrap();

    manager.reload().unwrap();
    assert_eq!(manager.config().servers.len(), 1);
    assert_eq!(manager.config().servers[0].name, "home");
    assert_eq!(manager.config_path(), path.as_path());
}

#[cfg(unix)]
#[test]
fn test_saved_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    AppConfig::parse(FULL).unwrap().save(&path).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[cfg(unix)]
#[test]
fn test_save_tightens_existing_file() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "stale").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

    let config = AppConfig::parse(FULL).unwrap();
    config.save(&path).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert_eq!(AppConfig::load(&path).unwrap().servers, config.servers);
}
