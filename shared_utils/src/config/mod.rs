//! Configuration management module for wgroster.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the roster helper and the operator CLI.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file used when no per-user file exists.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/wgroster/config.toml";

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
}

/// Longest interface name the kernel accepts.
const MAX_INTERFACE_NAME_LEN: usize = 15;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Tunnel device settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Interface name (default: "wg0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Device private key, base64
    #[serde(default)]
    pub private_key: Option<String>,

    /// File holding the device private key, base64
    #[serde(default)]
    pub private_key_file: Option<String>,

    /// UDP listen port (default: 51820)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Last octet of the device address, in [0, 255) (default: 1)
    #[serde(default = "default_node_index")]
    pub node_index: u16,

    /// Tunnel subnet, must be a /24 (default: "15.0.0.0/24")
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// Directory for the wg-quick file (default: "/etc/wireguard")
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Write `<config_dir>/<interface>.conf` when absent (default: true)
    #[serde(default = "default_true")]
    pub write_config_file: bool,

    /// Public `host:port` clients dial, written into client configs
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Where client configs for `[[users]]` are written
    #[serde(default)]
    pub client_config_dir: Option<String>,
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_node_index() -> u16 {
    1
}

fn default_subnet() -> String {
    "15.0.0.0/24".to_string()
}

fn default_config_dir() -> String {
    "/etc/wireguard".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            interface: default_interface(),
            private_key: None,
            private_key_file: None,
            listen_port: default_listen_port(),
            node_index: default_node_index(),
            subnet: default_subnet(),
            config_dir: default_config_dir(),
            write_config_file: default_true(),
            endpoint: None,
            client_config_dir: None,
        }
    }
}

impl DeviceConfig {
    /// Parsed tunnel subnet. Call after [`Config::validate`].
    pub fn subnet(&self) -> Result<Ipv4Net, ConfigError> {
        self.subnet.parse().map_err(|err: ipnet::AddrParseError| ConfigError::InvalidValue {
            key: "device.subnet".to_string(),
            message: err.to_string(),
        })
    }

    /// The base64 private key, inline or read from `private_key_file`.
    pub fn resolve_private_key(&self) -> Result<String, ConfigError> {
        match (&self.private_key, &self.private_key_file) {
            (Some(key), None) => Ok(key.trim().to_string()),
            (None, Some(path)) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.to_path_buf()));
                }
                Ok(fs::read_to_string(path)?.trim().to_string())
            }
            (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
                key: "device.private_key".to_string(),
                message: "set either private_key or private_key_file, not both".to_string(),
            }),
            (None, None) => Err(ConfigError::MissingValue(
                "device.private_key or device.private_key_file".to_string(),
            )),
        }
    }

    /// Path of the wg-quick file for this interface.
    pub fn config_file_path(&self) -> PathBuf {
        Path::new(&self.config_dir).join(format!("{}.conf", self.interface))
    }
}

/// Forwarding and masquerading rules installed at bring-up.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// Install FORWARD and MASQUERADE rules (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Egress interface; detected from the default route when unset
    #[serde(default)]
    pub egress_interface: Option<String>,
}

impl Default for NatConfig {
    fn default() -> Self {
        NatConfig {
            enabled: default_true(),
            egress_interface: None,
        }
    }
}

/// Peer lifecycle coordinator tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Re-read device status after each addition (default: true)
    #[serde(default = "default_true")]
    pub verify_after_apply: bool,

    /// Bound for a single device call in milliseconds (default: 5000)
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: Option<u64>,

    /// Remove device peers the roster does not know at startup (default: false)
    #[serde(default)]
    pub prune_unknown_peers: bool,
}

fn default_gateway_timeout_ms() -> Option<u64> {
    Some(5_000)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            verify_after_apply: default_true(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            prune_unknown_peers: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn gateway_timeout(&self) -> Option<Duration> {
        self.gateway_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

fn default_metrics_listen_addr() -> String {
    "127.0.0.1:9100".to_string()
}

/// A peer provisioned at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
}

/// A user provisioned at startup with generated keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,
}

/// Main configuration structure for wgroster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON (default: false)
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily-rotated log files here
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub nat: NatConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            json_logs: false,
            log_dir: None,
            device: DeviceConfig::default(),
            nat: NatConfig::default(),
            coordinator: CoordinatorConfig::default(),
            metrics: MetricsConfig::default(),
            peers: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid("log_level", format!("expected one of {LOG_LEVELS:?}")));
        }

        let device = &self.device;
        if device.interface.trim().is_empty() {
            return Err(ConfigError::MissingValue("device.interface".to_string()));
        }
        if device.interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(invalid(
                "device.interface",
                format!("at most {MAX_INTERFACE_NAME_LEN} characters"),
            ));
        }
        match (&device.private_key, &device.private_key_file) {
            (None, None) => {
                return Err(ConfigError::MissingValue(
                    "device.private_key or device.private_key_file".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "device.private_key",
                    "set either private_key or private_key_file, not both",
                ));
            }
            _ => {}
        }
        if device.listen_port == 0 {
            return Err(invalid("device.listen_port", "must be greater than 0"));
        }
        if device.node_index >= 255 {
            return Err(invalid("device.node_index", "must lie in [0, 255)"));
        }
        let subnet = device.subnet()?;
        if subnet.prefix_len() != 24 || subnet.addr() != subnet.network() {
            return Err(invalid("device.subnet", "must be a /24 network address"));
        }

        if let Some(egress) = &self.nat.egress_interface {
            if egress.trim().is_empty() {
                return Err(invalid("nat.egress_interface", "cannot be empty"));
            }
        }

        if self.coordinator.gateway_timeout_ms == Some(0) {
            return Err(invalid("coordinator.gateway_timeout_ms", "must be greater than 0"));
        }

        if self.metrics.enabled && self.metrics.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(invalid("metrics.listen_addr", "expected host:port"));
        }

        for (idx, peer) in self.peers.iter().enumerate() {
            if peer.public_key.trim().is_empty() {
                return Err(ConfigError::MissingValue(format!("peers[{idx}].public_key")));
            }
            if peer.allowed_ips.is_empty() {
                return Err(ConfigError::MissingValue(format!("peers[{idx}].allowed_ips")));
            }
        }
        for (idx, user) in self.users.iter().enumerate() {
            if user.name.trim().is_empty() {
                return Err(ConfigError::MissingValue(format!("users[{idx}].name")));
            }
            // names key the client config files
            if !is_file_name_safe(&user.name) {
                return Err(invalid(
                    &format!("users[{idx}].name"),
                    "use letters, digits, `-`, `_` or `.`, not starting with `.`",
                ));
            }
            if self.users[..idx].iter().any(|earlier| earlier.name == user.name) {
                return Err(invalid(
                    &format!("users[{idx}].name"),
                    format!("duplicate user name `{}`", user.name),
                ));
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: WGROSTER_)
    /// Example keys:
    /// - WGROSTER_LOG_LEVEL, WGROSTER_JSON_LOGS, WGROSTER_LOG_DIR
    /// - WGROSTER_DEVICE_INTERFACE, WGROSTER_DEVICE_PRIVATE_KEY, WGROSTER_DEVICE_PRIVATE_KEY_FILE,
    ///   WGROSTER_DEVICE_LISTEN_PORT, WGROSTER_DEVICE_NODE_INDEX, WGROSTER_DEVICE_SUBNET
    /// - WGROSTER_NAT_ENABLED, WGROSTER_NAT_EGRESS_INTERFACE
    /// - WGROSTER_COORDINATOR_GATEWAY_TIMEOUT_MS, WGROSTER_COORDINATOR_PRUNE_UNKNOWN_PEERS
    /// - WGROSTER_METRICS_ENABLED, WGROSTER_METRICS_LISTEN_ADDR
    pub fn apply_env_overrides(cfg: &mut Config) {
        Self::apply_overrides_from(cfg, |key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an explicit lookup.
    pub fn apply_overrides_from<F>(cfg: &mut Config, lookup: F)
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
        let var = |name: &str| lookup(&format!("WGROSTER_{name}")).filter(|v| !v.is_empty());

        // Top-level
        if let Some(v) = var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(b) = var("JSON_LOGS").as_deref().and_then(parse_bool) {
            cfg.json_logs = b;
        }
        if let Some(v) = var("LOG_DIR") {
            cfg.log_dir = Some(v);
        }

        // Device
        if let Some(v) = var("DEVICE_INTERFACE") {
            cfg.device.interface = v;
        }
        if let Some(v) = var("DEVICE_PRIVATE_KEY") {
            cfg.device.private_key = Some(v);
            cfg.device.private_key_file = None;
        }
        if let Some(v) = var("DEVICE_PRIVATE_KEY_FILE") {
            cfg.device.private_key_file = Some(v);
            cfg.device.private_key = None;
        }
        if let Some(n) = var("DEVICE_LISTEN_PORT").and_then(|v| v.parse().ok()) {
            cfg.device.listen_port = n;
        }
        if let Some(n) = var("DEVICE_NODE_INDEX").and_then(|v| v.parse().ok()) {
            cfg.device.node_index = n;
        }
        if let Some(v) = var("DEVICE_SUBNET") {
            cfg.device.subnet = v;
        }
        if let Some(v) = var("DEVICE_CONFIG_DIR") {
            cfg.device.config_dir = v;
        }
        if let Some(b) = var("DEVICE_WRITE_CONFIG_FILE").as_deref().and_then(parse_bool) {
            cfg.device.write_config_file = b;
        }
        if let Some(v) = var("DEVICE_ENDPOINT") {
            cfg.device.endpoint = Some(v);
        }

        // NAT
        if let Some(b) = var("NAT_ENABLED").as_deref().and_then(parse_bool) {
            cfg.nat.enabled = b;
        }
        if let Some(v) = var("NAT_EGRESS_INTERFACE") {
            cfg.nat.egress_interface = Some(v);
        }

        // Coordinator
        if let Some(b) = var("COORDINATOR_VERIFY_AFTER_APPLY")
            .as_deref()
            .and_then(parse_bool)
        {
            cfg.coordinator.verify_after_apply = b;
        }
        if let Some(n) = var("COORDINATOR_GATEWAY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.coordinator.gateway_timeout_ms = Some(n);
        }
        if let Some(b) = var("COORDINATOR_PRUNE_UNKNOWN_PEERS")
            .as_deref()
            .and_then(parse_bool)
        {
            cfg.coordinator.prune_unknown_peers = b;
        }

        // Metrics
        if let Some(b) = var("METRICS_ENABLED").as_deref().and_then(parse_bool) {
            cfg.metrics.enabled = b;
        }
        if let Some(v) = var("METRICS_LISTEN_ADDR") {
            cfg.metrics.listen_addr = v;
        }
    }

    /// Default configuration file: the user's `wgroster/config.toml` when it
    /// exists, otherwise [`SYSTEM_CONFIG_PATH`].
    pub fn default_path() -> PathBuf {
        Self::default_path_in(dirs::config_dir())
    }

    fn default_path_in(user_config_dir: Option<PathBuf>) -> PathBuf {
        user_config_dir
            .map(|dir| dir.join("wgroster").join("config.toml"))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH))
    }
}

fn is_file_name_safe(name: &str) -> bool {
    !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
