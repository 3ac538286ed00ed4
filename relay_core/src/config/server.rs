//! Server records: one configured remote relay endpoint per entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::ConfigError;

/// Transport protocol used to reach a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Default)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "ssh")]
    Ssh,
    /// WireGuard-style encrypted overlay.
    #[serde(rename = "vpn-overlay", alias = "wireguard")]
    VpnOverlay,
    #[serde(
        rename = "tls-camouflage",
        alias = "trojan",
        alias = "v2ray",
        alias = "vless",
        alias = "vmess"
    )]
    TlsCamouflage,
    /// QUIC/Hysteria-style UDP transport.
    #[serde(rename = "udp-fast", alias = "hysteria")]
    UdpFast,
}

impl TransportKind {
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Ssh,
        TransportKind::VpnOverlay,
        TransportKind::TlsCamouflage,
        TransportKind::UdpFast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::VpnOverlay => "vpn-overlay",
            TransportKind::TlsCamouflage => "tls-camouflage",
            TransportKind::UdpFast => "udp-fast",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(TransportKind::Ssh),
            "vpn-overlay" | "wireguard" => Ok(TransportKind::VpnOverlay),
            "tls-camouflage" | "trojan" | "v2ray" | "vless" | "vmess" => {
                Ok(TransportKind::TlsCamouflage)
            }
            "udp-fast" | "hysteria" => Ok(TransportKind::UdpFast),
            other => Err(ConfigError::InvalidValue {
                key: "transport".to_string(),
                message: format!("unknown transport kind '{other}'"),
            }),
        }
    }
}

/// Kind of local proxy listener a tunnel exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Socks5,
    Http,
}

/// Key material for VPN-overlay transports.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct VpnOverlaySettings {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    pub mtu: Option<u16>,
}

/// Settings for UDP-fast transports.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct UdpFastSettings {
    #[serde(default)]
    pub auth_string: String,
    pub up_mbps: Option<u32>,
    pub down_mbps: Option<u32>,
    pub obfs: Option<String>,
    pub alpn: Option<String>,
}

/// Settings for TLS-camouflaged transports.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct TlsCamouflageSettings {
    #[serde(default)]
    pub uuid: String,
    pub server_name: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
}

/// One configured remote endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Unique name; synthesized as `server-<n>` when empty
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub host: String,

    pub port: Option<u16>,

    pub user: Option<String>,

    pub password: Option<String>,

    /// Private key reference, used instead of a password
    pub key_path: Option<String>,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub proxy: ProxyKind,

    /// Local proxy port; 0 means "assign from the base port"
    #[serde(default)]
    pub local_port: u16,

    /// Lower values are preferred during failover
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub max_retries: u32,

    /// Dial timeout in seconds
    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    pub region: Option<String>,

    pub vpn_overlay: Option<VpnOverlaySettings>,

    pub udp_fast: Option<UdpFastSettings>,

    pub tls_camouflage: Option<TlsCamouflageSettings>,
}

fn default_true() -> bool {
    true
}

pub const DEFAULT_LOCAL_PORT_BASE: u16 = 8080;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

impl TunnelConfig {
    /// Creates an enabled ssh record with every optional field unset.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        TunnelConfig {
            name: name.into(),
            host: host.into(),
            port: Some(port),
            user: None,
            password: None,
            key_path: None,
            transport: TransportKind::Ssh,
            proxy: ProxyKind::Socks5,
            local_port: 0,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            enabled: true,
            tags: Vec::new(),
            region: None,
            vpn_overlay: None,
            udp_fast: None,
            tls_camouflage: None,
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Port, or 0 when missing (validation rejects that case).
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port_or_default())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn has_credentials(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.key_path.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Fills in the defaults for the record at position `index`.
    pub(crate) fn apply_defaults(&mut self, index: usize) {
        if self.name.trim().is_empty() {
            self.name = format!("server-{}", index + 1);
        }
        if self.local_port == 0 {
            let offset = u16::try_from(index).unwrap_or(u16::MAX);
            self.local_port = DEFAULT_LOCAL_PORT_BASE.saturating_add(offset);
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
    }

    /// Checks the mandatory fields for this record's transport kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = |field: &str| format!("servers.{}.{field}", self.name);

        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingValue(key("host")));
        }
        if self.host.starts_with('-') {
            return Err(ConfigError::InvalidValue {
                key: key("host"),
                message: format!("'{}' is not a host name", self.host),
            });
        }
        if self.port_or_default() == 0 {
            return Err(ConfigError::MissingValue(key("port")));
        }

        match self.transport {
            TransportKind::Ssh => {
                if self.user.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::MissingValue(key("user")));
                }
                if !self.has_credentials() {
                    return Err(ConfigError::MissingValue(key("password or key_path")));
                }
            }
            TransportKind::VpnOverlay => {
                let keys = self.vpn_overlay.as_ref();
                if keys.is_none_or(|k| k.private_key.is_empty() || k.public_key.is_empty()) {
                    return Err(ConfigError::MissingValue(key(
                        "vpn_overlay.private_key and vpn_overlay.public_key",
                    )));
                }
            }
            TransportKind::UdpFast => {
                if self.udp_fast.as_ref().is_none_or(|u| u.auth_string.is_empty()) {
                    return Err(ConfigError::MissingValue(key("udp_fast.auth_string")));
                }
            }
            TransportKind::TlsCamouflage => {
                if self.tls_camouflage.as_ref().is_none_or(|t| t.uuid.is_empty()) {
                    return Err(ConfigError::MissingValue(key("tls_camouflage.uuid")));
                }
            }
        }
        Ok(())
    }

    /// Copy with secrets replaced, for display and the management API.
    pub fn redacted(&self) -> Self {
        const MASK: &str = "********";
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some(MASK.to_string());
        }
        if let Some(vpn) = copy.vpn_overlay.as_mut() {
            vpn.private_key = MASK.to_string();
            if vpn.preshared_key.is_some() {
                vpn.preshared_key = Some(MASK.to_string());
            }
        }
        if let Some(udp) = copy.udp_fast.as_mut() {
            udp.auth_string = MASK.to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: TransportKind,
        }
        let parse = |s: &str| {
            toml::from_str::<Wrapper>(&format!("transport = \"{s}\""))
                .unwrap()
                .transport
        };
        assert_eq!(parse("ssh"), TransportKind::Ssh);
        assert_eq!(parse("wireguard"), TransportKind::VpnOverlay);
        assert_eq!(parse("trojan"), TransportKind::TlsCamouflage);
        assert_eq!(parse("hysteria"), TransportKind::UdpFast);
        assert_eq!("udp-fast".parse::<TransportKind>().unwrap(), TransportKind::UdpFast);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_defaults_by_index() {
        let mut record = TunnelConfig::new("", "relay.example.com", 22);
        record.local_port = 0;
        record.max_retries = 0;
        record.timeout_secs = 0;
        record.apply_defaults(2);

        assert_eq!(record.name, "server-3");
        assert_eq!(record.local_port, 8082);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_transport_specific_validation() {
        let ssh = TunnelConfig::new("a", "h", 22).with_user("root");
        assert!(ssh.validate().is_err());
        assert!(ssh.clone().with_key_path("~/.ssh/id_ed25519").validate().is_ok());

        let mut vpn = TunnelConfig::new("b", "h", 51820).with_transport(TransportKind::VpnOverlay);
        assert!(vpn.validate().is_err());
        vpn.vpn_overlay = Some(VpnOverlaySettings {
            private_key: "priv".into(),
            public_key: "pub".into(),
            ..Default::default()
        });
        assert!(vpn.validate().is_ok());

        let mut udp = TunnelConfig::new("c", "h", 443).with_transport(TransportKind::UdpFast);
        assert!(udp.validate().is_err());
        udp.udp_fast = Some(UdpFastSettings {
            auth_string: "secret".into(),
            ..Default::default()
        });
        assert!(udp.validate().is_ok());

        let mut missing_port = TunnelConfig::new("d", "h", 22).with_user("u").with_password("p");
        missing_port.port = None;
        assert!(matches!(
            missing_port.validate(),
            Err(ConfigError::MissingValue(key)) if key == "servers.d.port"
        ));

        let option_like = TunnelConfig::new("e", "-f", 22).with_user("u").with_password("p");
        assert!(matches!(
            option_like.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "servers.e.host"
        ));
    }

    #[test]
    fn test_redaction_hides_secrets() {
        let record = TunnelConfig::new("a", "h", 22)
            .with_user("root")
            .with_password("hunter2");
        let redacted = record.redacted();
        assert_eq!(redacted.password.as_deref(), Some("********"));
        assert_eq!(redacted.user.as_deref(), Some("root"));
    }
}
