//! Configuration management

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::sub_ip;
use crate::store::LinkSpec;
use crate::DEFAULT_PORT;

/// Offset of the cluster DNS service inside the service network
pub const CLUSTER_DNS_IP: u32 = 10;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to write config: {0}")]
    Write(std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker settings
    pub broker: BrokerConfig,
    /// TLS settings; tunnels run unauthenticated without them
    pub tls: Option<TlsConfig>,
    /// Advertisement settings
    #[serde(default)]
    pub advertise: AdvertiseConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Declared links, fed to the reconciler at startup
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Validate and resolve into runtime settings.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let cluster_address: IpNet = self.broker.link_address.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "invalid link address {:?}: {}",
                self.broker.link_address, e
            ))
        })?;
        if cluster_address.addr().is_unspecified() {
            return Err(ConfigError::Invalid("link address required".into()));
        }

        let service_cidr = match self.broker.service_cidr.as_deref().filter(|c| !c.is_empty()) {
            Some(cidr) => Some(cidr.parse::<IpNet>().map_err(|e| {
                ConfigError::Invalid(format!("invalid service cidr {:?}: {}", cidr, e))
            })?),
            None => None,
        };

        if self.broker.auto_connect {
            if service_cidr.is_none() {
                return Err(ConfigError::Invalid(
                    "auto-connect requires local service cidr".into(),
                ));
            }
            if self.tls.is_none() {
                return Err(ConfigError::Invalid(
                    "auto-connect requires authenticated mode, configure tls".into(),
                ));
            }
        }

        let dns_service_ip = match self.advertise.dns_service_ip.as_deref() {
            Some(ip) => Some(ip.parse::<IpAddr>().map_err(|_| {
                ConfigError::Invalid(format!("invalid dns service ip {:?}", ip))
            })?),
            None => service_cidr.as_ref().map(|c| sub_ip(c, CLUSTER_DNS_IP)),
        };

        Ok(Settings {
            cluster_address,
            service_cidr,
            port: self.broker.port,
            advertised_port: self.broker.advertised_port.unwrap_or(self.broker.port),
            dial_budget: Duration::from_secs(self.broker.dial_budget_secs),
            dns_service_ip,
        })
    }
}

/// Resolved runtime settings derived from a valid config.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Own address inside the mesh, with the mesh prefix
    pub cluster_address: IpNet,
    pub service_cidr: Option<IpNet>,
    pub port: u16,
    pub advertised_port: u16,
    pub dial_budget: Duration,
    pub dns_service_ip: Option<IpAddr>,
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Name of the local cluster in the mesh
    #[serde(default)]
    pub cluster_name: String,
    /// Own CIDR in the cluster network, e.g. `192.168.0.11/24`
    pub link_address: String,
    /// CIDR of the local service network
    #[serde(default)]
    pub service_cidr: Option<String>,
    /// Port the broker listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port advertised to peers, when it differs from the listen port
    #[serde(default)]
    pub advertised_port: Option<u16>,
    /// Comma separated list of links to serve, or `all`
    #[serde(default = "default_served")]
    pub served_links: String,
    /// Register authenticated unknown peers automatically
    #[serde(default)]
    pub auto_connect: bool,
    /// Accept anonymous inbound tunnels (`::/0` hello)
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Deadline applied separately to dial, TLS and hello exchange
    #[serde(default = "default_dial_budget")]
    pub dial_budget_secs: u64,
    /// Name of the tun interface
    #[serde(default)]
    pub interface: Option<String>,
    /// Base domain for mesh services
    #[serde(default = "default_mesh_domain")]
    pub mesh_domain: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            link_address: String::new(),
            service_cidr: None,
            port: DEFAULT_PORT,
            advertised_port: None,
            served_links: default_served(),
            auto_connect: false,
            allow_anonymous: false,
            dial_budget_secs: default_dial_budget(),
            interface: None,
            mesh_domain: default_mesh_domain(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_served() -> String {
    "all".into()
}

fn default_dial_budget() -> u64 {
    30
}

fn default_mesh_domain() -> String {
    "mesh".into()
}

/// TLS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS certificate file
    pub cert_file: PathBuf,
    /// TLS certificate key file
    pub key_file: PathBuf,
    /// CA certificate file peers must be issued by
    pub ca_cert_file: PathBuf,
}

/// Advertisement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    /// Advertise DNS access info to peers during the handshake
    #[serde(default)]
    pub dns_advertisement: bool,
    /// IP of the cluster DNS service; derived from the service network
    /// when unset
    #[serde(default)]
    pub dns_service_ip: Option<String>,
    /// Cluster domain of the DNS service
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
    /// Service account for API access propagation
    #[serde(default)]
    pub service_account: Option<String>,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            dns_advertisement: false,
            dns_service_ip: None,
            cluster_domain: default_cluster_domain(),
            service_account: None,
        }
    }
}

fn default_cluster_domain() -> String {
    "cluster.local".into()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [broker]
            link_address = "192.168.0.11/24"
            service_cidr = "100.64.0.0/20"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.broker.port, DEFAULT_PORT);
        assert_eq!(config.broker.served_links, "all");
        assert!(!config.broker.auto_connect);
        assert_eq!(config.logging.level, "info");

        let settings = config.settings().unwrap();
        assert_eq!(settings.advertised_port, DEFAULT_PORT);
        assert_eq!(settings.dial_budget, Duration::from_secs(30));
        // DNS service IP derived from the service network
        assert_eq!(
            settings.dns_service_ip,
            Some("100.64.0.10".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_link_address() {
        let mut config = minimal();
        config.broker.link_address = "bogus".into();
        assert!(matches!(config.settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_auto_connect_requirements() {
        let mut config = minimal();
        config.broker.auto_connect = true;
        // No TLS configured
        assert!(matches!(config.settings(), Err(ConfigError::Invalid(_))));

        config.tls = Some(TlsConfig {
            cert_file: "/etc/mesh/tls.crt".into(),
            key_file: "/etc/mesh/tls.key".into(),
            ca_cert_file: "/etc/mesh/ca.crt".into(),
        });
        config.settings().unwrap();

        config.broker.service_cidr = None;
        assert!(matches!(config.settings(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_links_section() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            link_address = "192.168.0.11/24"

            [[links]]
            name = "peer1"
            cluster_address = "192.168.0.12/24"
            endpoint = "peer1.example:8088"
            egress = ["100.64.16.0/20"]
            "#,
        )
        .unwrap();
        assert_eq!(config.links.len(), 1);
        assert_eq!(config.links[0].name, "peer1");
    }
}
