//! Strand Configuration Management
//!
//! Provides configuration loading, parsing, and validation for Strand relay
//! nodes. Configuration comes from a TOML file; every key has a default so a
//! minimal file only needs the node identity and role.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Node roles selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Terminates Portal and Agent streams; may dial outward to gateways
    Service,
    /// Terminates Portal and Agent streams plus inbound Service connections
    Gateway,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Service => f.write_str("service"),
            NodeRole::Gateway => f.write_str("gateway"),
        }
    }
}

/// Complete relay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Role this node assumes
    pub role: NodeRole,
    /// Instance id, unique across the fleet
    pub instance_id: String,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Node identity key material
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Gateway cross-stitching configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Stream limits and timers
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Feature toggles
    #[serde(default)]
    pub features: FeatureConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static token table for deployments without a validation backend
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the server to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where `GET /` redirects; 404 when unset
    pub redirect_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            redirect_url: None,
        }
    }
}

/// Node identity key material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// PKCS#8 PEM private key, inline
    pub private_key_pem: Option<String>,
    /// Path to a PKCS#8 PEM private key file; overrides the inline form
    pub private_key_file: Option<PathBuf>,
    /// Advertised expiry of the key material
    pub key_expires_on: Option<chrono::DateTime<chrono::Utc>>,
}

/// Gateway cross-stitching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Pre-shared key for the gateway handshake
    pub pre_shared_key: Option<String>,
    /// Gateway URLs this Service node dials outward
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Stream limits and timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Cumulative byte budget for a stream before authentication
    #[serde(default = "default_max_bytes_before_authentication")]
    pub max_bytes_before_authentication: usize,
    /// Per-frame size cap after authentication
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// WebSocket receive buffer size in bytes
    #[serde(default = "default_receive_buffer_size")]
    pub websocket_receive_buffer_size: usize,
    /// Liveness ping cadence in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Outward gateway redial delay in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Deadline for a relayed control response, in seconds
    #[serde(default = "default_control_response_timeout")]
    pub control_response_timeout_secs: u64,
    /// Registry rows older than this are inactive, in seconds
    #[serde(default = "default_client_inactivity_timeout")]
    pub client_inactivity_timeout_secs: u64,
    /// Registry rows older than this are purged, in seconds
    #[serde(default = "default_connection_retention")]
    pub connection_retention_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_bytes_before_authentication: default_max_bytes_before_authentication(),
            max_message_size: default_max_message_size(),
            websocket_receive_buffer_size: default_receive_buffer_size(),
            ping_interval_secs: default_ping_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            control_response_timeout_secs: default_control_response_timeout(),
            client_inactivity_timeout_secs: default_client_inactivity_timeout(),
            connection_retention_secs: default_connection_retention(),
        }
    }
}

impl LimitsConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn control_response_timeout(&self) -> Duration {
        Duration::from_secs(self.control_response_timeout_secs)
    }

    pub fn client_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.client_inactivity_timeout_secs)
    }

    pub fn connection_retention(&self) -> Duration {
        Duration::from_secs(self.connection_retention_secs)
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Suppress liveness pings on outward gateway connections
    #[serde(default)]
    pub disable_ping_messages: bool,
    /// Skip the durable client history sink
    #[serde(default)]
    pub disable_database_client_history: bool,
    /// Keep the tenant registry in process memory only
    #[serde(default)]
    pub in_memory_client_list: bool,
    /// Skip the durable statistics sink
    #[serde(default)]
    pub disable_database_statistics: bool,
    /// Protocol versions agents may assert
    #[serde(default = "default_allowed_protocol_versions")]
    pub allowed_protocol_versions: BTreeSet<u32>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            disable_ping_messages: false,
            disable_database_client_history: false,
            in_memory_client_list: false,
            disable_database_statistics: false,
            allowed_protocol_versions: default_allowed_protocol_versions(),
        }
    }
}

/// Static token table; the standalone stand-in for the external validator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// token → grant
    #[serde(default)]
    pub tokens: std::collections::HashMap<String, StaticToken>,
}

/// One statically-granted token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub organization_id: String,
    pub registered_agent_id: Option<String>,
    /// Validity from the moment of use; unlimited when unset
    pub ttl_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RelayConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Validation("instance_id must be set".into()));
        }
        if !self.gateway.servers.is_empty() && self.role != NodeRole::Service {
            return Err(ConfigError::Validation(
                "gateway.servers is only valid for the service role".into(),
            ));
        }
        if (!self.gateway.servers.is_empty() || self.role == NodeRole::Gateway)
            && self.gateway.pre_shared_key.is_none()
        {
            return Err(ConfigError::Validation(
                "gateway.pre_shared_key is required when gateway features are in use".into(),
            ));
        }
        for url in &self.gateway.servers {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::Validation(format!(
                    "gateway server `{url}` is not a websocket URL"
                )));
            }
        }
        if self.features.allowed_protocol_versions.is_empty() {
            return Err(ConfigError::Validation(
                "allowed_protocol_versions must not be empty".into(),
            ));
        }
        if self.limits.max_message_size == 0 || self.limits.max_bytes_before_authentication == 0 {
            return Err(ConfigError::Validation(
                "message size limits must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the private key PEM, preferring the file form
    pub fn private_key_pem(&self) -> Result<Option<String>, ConfigError> {
        if let Some(path) = &self.identity.private_key_file {
            return Ok(Some(std::fs::read_to_string(path)?));
        }
        Ok(self.identity.private_key_pem.clone())
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8443
}

fn default_max_bytes_before_authentication() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_receive_buffer_size() -> usize {
    16 * 1024
}

fn default_ping_interval() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_control_response_timeout() -> u64 {
    30
}

fn default_client_inactivity_timeout() -> u64 {
    5 * 60
}

fn default_connection_retention() -> u64 {
    24 * 60 * 60
}

fn default_allowed_protocol_versions() -> BTreeSet<u32> {
    BTreeSet::from([1])
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_service_config_parses() {
        let config = RelayConfig::from_toml(
            r#"
            role = "service"
            instance_id = "node-a"
            "#,
        )
        .unwrap();
        assert_eq!(config.role, NodeRole::Service);
        assert_eq!(config.limits.max_bytes_before_authentication, 100_000);
        assert_eq!(config.limits.ping_interval(), Duration::from_secs(30));
        assert!(config.features.allowed_protocol_versions.contains(&1));
    }

    #[test]
    fn gateway_servers_require_psk() {
        let err = RelayConfig::from_toml(
            r#"
            role = "service"
            instance_id = "node-a"

            [gateway]
            servers = ["wss://gw1.example.com/gateway"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn gateway_role_requires_psk() {
        let err = RelayConfig::from_toml(
            r#"
            role = "gateway"
            instance_id = "gw-1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn non_websocket_gateway_url_rejected() {
        let err = RelayConfig::from_toml(
            r#"
            role = "service"
            instance_id = "node-a"

            [gateway]
            pre_shared_key = "secret"
            servers = ["https://gw1.example.com"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn gateway_servers_invalid_for_gateway_role() {
        let err = RelayConfig::from_toml(
            r#"
            role = "gateway"
            instance_id = "gw-1"

            [gateway]
            pre_shared_key = "secret"
            servers = ["wss://gw2.example.com/gateway"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
