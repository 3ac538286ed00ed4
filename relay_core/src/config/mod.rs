//! Configuration management for meshrelay.
//!
//! Configuration lives in a TOML file that may be stored as plaintext or sealed
//! with a passphrase (see [`crate::crypto`]). Loading applies per-server
//! defaults, then `MESHRELAY_*` environment overrides, then validation.

mod server;

pub use server::{
    ProxyKind, TlsCamouflageSettings, TransportKind, TunnelConfig, UdpFastSettings,
    VpnOverlaySettings, DEFAULT_LOCAL_PORT_BASE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS,
};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto;
use crate::mesh::MeshConfig;

/// Environment variable holding the configuration passphrase.
pub const PASSPHRASE_ENV: &str = "CONFIG_PASSWORD";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    /// Encrypted file with a missing or wrong passphrase
    #[error("Failed to decrypt configuration: {0}")]
    Decryption(String),

    /// Sealing the file on save failed
    #[error("Failed to encrypt configuration: {0}")]
    Encryption(String),
}

impl ConfigError {
    /// True for the missing/invalid value family surfaced before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConfigError::MissingValue(_) | ConfigError::InvalidValue { .. }
        )
    }
}

/// Security configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enable_tls: bool,

    pub tls_cert_path: Option<String>,

    pub tls_key_path: Option<String>,

    /// Require a bearer token on management API calls
    #[serde(default)]
    pub enable_auth: bool,

    /// Allow-list of bearer tokens
    #[serde(default)]
    pub auth_tokens: Vec<String>,

    /// Seal the file with the out-of-band passphrase on save
    #[serde(default)]
    pub encrypt_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Domain,
    Ip,
    Geoip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Proxy,
    Direct,
    Block,
}

/// Traffic routing rule. Applied by the platform layer, carried here as data.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub pattern: String,
    pub action: RuleAction,
    /// Server that proxied traffic should use
    pub server: Option<String>,
}

/// Monitoring configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MonitoringConfig {
    /// Enables the metrics and logs endpoints
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional directory for rolling log files
    pub log_dir: Option<String>,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enabled: false,
            check_interval_secs: default_check_interval_secs(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Management API settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub enable_cors: bool,
}

fn default_api_host() -> String {
    "localhost".to_string()
}

fn default_api_port() -> u16 {
    8888
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            enabled: false,
            host: default_api_host(),
            port: default_api_port(),
            enable_cors: false,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub servers: Vec<TunnelConfig>,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub routing: Vec<RoutingRule>,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// Pick and start one tunnel as soon as the orchestrator starts
    #[serde(default)]
    pub auto_select: bool,

    /// "latency", "random" or "load"; unknown names behave like "latency"
    #[serde(default = "default_selection_method")]
    pub selection_method: String,

    #[serde(default = "default_latency_timeout_secs")]
    pub latency_timeout_secs: u64,

    #[serde(default)]
    pub enable_failover: bool,

    #[serde(default = "default_failover_timeout_secs")]
    pub failover_timeout_secs: u64,

    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_selection_method() -> String {
    "latency".to_string()
}

fn default_latency_timeout_secs() -> u64 {
    5
}

fn default_failover_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            version: default_version(),
            servers: Vec::new(),
            security: SecurityConfig::default(),
            routing: Vec::new(),
            monitoring: MonitoringConfig::default(),
            api: ApiConfig::default(),
            auto_select: false,
            selection_method: default_selection_method(),
            latency_timeout_secs: default_latency_timeout_secs(),
            enable_failover: false,
            failover_timeout_secs: default_failover_timeout_secs(),
            mesh: MeshConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        AppConfig::default()
    }

    /// Load configuration from a TOML file, using `CONFIG_PASSWORD` if it is sealed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_passphrase(path, None)
    }

    /// Load configuration, preferring an explicit passphrase over `CONFIG_PASSWORD`.
    pub fn load_with_passphrase<P: AsRef<Path>>(
        path: P,
        passphrase: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let raw = fs::read(path)?;
        let plaintext = if crypto::is_sealed(&raw) {
            debug!(path = %path.display(), "configuration is encrypted");
            let passphrase = resolve_passphrase(passphrase).ok_or_else(|| {
                ConfigError::Decryption(format!(
                    "configuration is encrypted; set {PASSPHRASE_ENV} or pass a passphrase"
                ))
            })?;
            crypto::open(&raw, &passphrase).map_err(|e| ConfigError::Decryption(e.to_string()))?
        } else {
            raw
        };

        let content = String::from_utf8(plaintext).map_err(|_| ConfigError::InvalidValue {
            key: path.display().to_string(),
            message: "configuration is not valid UTF-8".to_string(),
        })?;

        let mut config = Self::parse(&content)?;
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        info!(path = %path.display(), servers = config.servers.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML text and apply record defaults, without validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = toml::from_str(content)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Save configuration, sealing it when `security.encrypt_config` is set.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.save_with_passphrase(path, None)
    }

    pub fn save_with_passphrase<P: AsRef<Path>>(
        &self,
        path: P,
        passphrase: Option<&str>,
    ) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        let bytes = if self.security.encrypt_config {
            let passphrase = resolve_passphrase(passphrase).ok_or_else(|| {
                ConfigError::Encryption(format!(
                    "encrypt_config is set but no passphrase was given ({PASSPHRASE_ENV})"
                ))
            })?;
            crypto::seal(content.as_bytes(), &passphrase)
                .map_err(|e| ConfigError::Encryption(e.to_string()))?
                .into_bytes()
        } else {
            content.into_bytes()
        };

        write_private(path.as_ref(), &bytes)?;
        Ok(())
    }

    /// Fill in per-server defaults: names, local ports, retry budget, timeout.
    pub fn apply_defaults(&mut self) {
        for (index, server) in self.servers.iter_mut().enumerate() {
            server.apply_defaults(index);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::MissingValue(
                "servers (at least one server is required)".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for server in &self.servers {
            server.validate()?;

            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("servers.{}", server.name),
                    message: "duplicate server name".to_string(),
                });
            }
            if server.enabled && !ports.insert(server.local_port) {
                return Err(ConfigError::InvalidValue {
                    key: format!("servers.{}.local_port", server.name),
                    message: format!("local port {} is already used", server.local_port),
                });
            }
        }

        for rule in &self.routing {
            if let Some(target) = rule.server.as_deref() {
                if !names.contains(target) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("routing.{}", rule.pattern),
                        message: format!("unknown server '{target}'"),
                    });
                }
            }
        }

        if self.security.enable_auth && self.security.auth_tokens.is_empty() {
            return Err(ConfigError::MissingValue(
                "security.auth_tokens must be provided when enable_auth=true".to_string(),
            ));
        }

        if self.monitoring.enabled && self.monitoring.check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "monitoring.check_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.enable_failover && self.failover_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "failover_timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        self.mesh.validate()
    }

    pub fn latency_timeout(&self) -> Duration {
        Duration::from_secs(self.latency_timeout_secs.max(1))
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_timeout_secs.max(1))
    }

    /// Copy with passwords, keys and API tokens masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.servers = self.servers.iter().map(TunnelConfig::redacted).collect();
        copy.security.auth_tokens = vec!["********".to_string(); self.security.auth_tokens.len()];
        copy
    }

    /// Apply environment variable overrides (prefix: MESHRELAY_)
    /// Example keys:
    /// - MESHRELAY_LOG_LEVEL, MESHRELAY_MONITORING_ENABLED
    /// - MESHRELAY_API_ENABLED, MESHRELAY_API_HOST, MESHRELAY_API_PORT
    /// - MESHRELAY_AUTH_ENABLED, MESHRELAY_AUTH_TOKENS (comma separated)
    /// - MESHRELAY_AUTO_SELECT, MESHRELAY_SELECTION_METHOD
    /// - MESHRELAY_ENABLE_FAILOVER, MESHRELAY_FAILOVER_TIMEOUT_SECS
    /// - MESHRELAY_MESH_ADDRESS_BLOCK
    fn apply_env_overrides(cfg: &mut AppConfig) {
        Self::apply_overrides_from(cfg, |key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from<F>(cfg: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MESHRELAY_LOG_LEVEL") {
            cfg.monitoring.log_level = v;
        }
        if let Some(b) = get("MESHRELAY_MONITORING_ENABLED").as_deref().and_then(parse_bool) {
            cfg.monitoring.enabled = b;
        }

        if let Some(b) = get("MESHRELAY_API_ENABLED").as_deref().and_then(parse_bool) {
            cfg.api.enabled = b;
        }
        if let Some(v) = get("MESHRELAY_API_HOST") {
            cfg.api.host = v;
        }
        if let Some(n) = get("MESHRELAY_API_PORT").and_then(|v| v.parse().ok()) {
            cfg.api.port = n;
        }

        if let Some(b) = get("MESHRELAY_AUTH_ENABLED").as_deref().and_then(parse_bool) {
            cfg.security.enable_auth = b;
        }
        if let Some(v) = get("MESHRELAY_AUTH_TOKENS") {
            let tokens = split_csv(&v);
            if !tokens.is_empty() {
                cfg.security.auth_tokens = tokens;
            }
        }

        if let Some(b) = get("MESHRELAY_AUTO_SELECT").as_deref().and_then(parse_bool) {
            cfg.auto_select = b;
        }
        if let Some(v) = get("MESHRELAY_SELECTION_METHOD") {
            cfg.selection_method = v;
        }
        if let Some(b) = get("MESHRELAY_ENABLE_FAILOVER").as_deref().and_then(parse_bool) {
            cfg.enable_failover = b;
        }
        if let Some(n) = get("MESHRELAY_FAILOVER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            cfg.failover_timeout_secs = n;
        }

        if let Some(v) = get("MESHRELAY_MESH_ADDRESS_BLOCK") {
            cfg.mesh.address_block = v;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Directory holding meshrelay's configuration and state files.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("meshrelay"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Explicit passphrase first, then `CONFIG_PASSWORD`.
pub fn resolve_passphrase(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(PASSPHRASE_ENV).ok())
        .filter(|p| !p.is_empty())
}

/// Writes a file readable only by its owner on unix.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        let mut file = options.open(path)?;
        // mode only applies on creation
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(bytes)?;
    }
    #[cfg(not(unix))]
    options.open(path)?.write_all(bytes)?;
    Ok(())
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: AppConfig,
    /// Path to the configuration file
    config_path: PathBuf,
    /// Passphrase used for sealed files, if any
    passphrase: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: AppConfig::default(),
            config_path: AppConfig::default_path(),
            passphrase: None,
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_passphrase(path, None)
    }

    pub fn load_with_passphrase<P: AsRef<Path>>(
        path: P,
        passphrase: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = AppConfig::load_with_passphrase(&path, passphrase)?;

        Ok(ConfigManager {
            config,
            config_path: path,
            passphrase: passphrase.map(str::to_string),
        })
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config =
            AppConfig::load_with_passphrase(&self.config_path, self.passphrase.as_deref())?;
        Ok(())
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config
            .save_with_passphrase(&self.config_path, self.passphrase.as_deref())
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
