//! Configuration system for the otter node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (OTTER_* prefix, plus SERVICE_NAME)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::types::default_node_id;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and listener settings
    pub node: NodeSettings,

    /// Discovery registry settings
    pub registry: RegistrySettings,

    /// Outbound delivery settings
    pub dispatch: DispatchSettings,

    /// Inbound connection settings
    pub receiver: ReceiverSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Registry service ID (host name if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Container name, announced as the service name and sent as credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// Role of this node, the first registry tag
    pub role: String,

    /// Compute device, the second registry tag
    pub device: String,

    /// Additional registry tags
    pub tags: Vec<String>,

    /// Interface to bind the receiver on
    pub listen_host: String,

    /// Receiver port (0 = ephemeral)
    pub listen_port: u16,

    /// DNS name to resolve for the advertised address (e.g. a swarm service VIP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Advertise this address instead of resolving one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<IpAddr>,
}

/// Discovery registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Registry agent HTTP URL
    pub url: String,

    /// Interval between discovery polls in milliseconds
    pub poll_interval_ms: u64,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Health check interval (registry duration string)
    pub check_interval: String,

    /// Health check timeout
    pub check_timeout: String,

    /// Remove the service after it has been critical this long
    pub deregister_after: String,

    /// Deregister from the registry on shutdown
    pub deregister_on_shutdown: bool,
}

/// Outbound delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Roles (tags or service names) of the peers to send to
    pub target_roles: Vec<String>,

    /// Peer connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Delay between delivery attempts to one peer in milliseconds
    pub retry_delay_ms: u64,
}

/// Inbound connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Maximum accepted payload size in bytes (0 = unbounded)
    pub max_frame_bytes: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            container_name: None,
            role: "default_role".to_string(),
            device: "CPU".to_string(),
            tags: vec![],
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5000,
            service_name: None,
            advertise_address: None,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8500".to_string(),
            poll_interval_ms: 5000,
            request_timeout_ms: 5000,
            check_interval: "5s".to_string(),
            check_timeout: "1s".to_string(),
            deregister_after: "10s".to_string(),
            deregister_on_shutdown: true,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            target_roles: vec![],
            connect_timeout_ms: 10_000,
            retry_delay_ms: 3000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl RegistrySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DispatchSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ReceiverSettings {
    /// Frame size cap, `None` when unbounded
    pub fn frame_limit(&self) -> Option<usize> {
        (self.max_frame_bytes > 0).then_some(self.max_frame_bytes)
    }
}

impl NodeConfig {
    /// Configuration for one node, equivalent to the classic
    /// `(port, container name, role, device, registry URL, target roles)`
    /// constructor arguments. Everything else keeps its default.
    pub fn for_node(
        port: u16,
        container_name: impl Into<String>,
        role: impl Into<String>,
        device: impl Into<String>,
        registry_url: impl Into<String>,
        target_roles: Vec<String>,
    ) -> Self {
        let mut config = Self::default();
        config.node.listen_port = port;
        config.node.container_name = Some(container_name.into());
        config.node.role = role.into();
        config.node.device = device.into();
        config.registry.url = registry_url.into();
        config.dispatch.target_roles = target_roles;
        config
    }

    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_unvalidated(config_path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and merge configuration sources without validating the result
    pub fn load_unvalidated(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            // Current directory
            Some(PathBuf::from("otter-node.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("otter").join("node.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".otter").join("node.toml")),
            // System config (Linux)
            Some(PathBuf::from("/etc/otter/node.toml")),
        ];

        for path in search_paths.into_iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("OTTER_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("OTTER_CONTAINER_NAME") {
            self.node.container_name = Some(val);
        }
        if let Ok(val) = std::env::var("OTTER_ROLE") {
            self.node.role = val;
        }
        if let Ok(val) = std::env::var("OTTER_DEVICE") {
            self.node.device = val;
        }
        if let Ok(val) = std::env::var("OTTER_TAGS") {
            self.node.tags = split_list(&val);
        }
        if let Ok(val) = std::env::var("OTTER_LISTEN_HOST") {
            self.node.listen_host = val;
        }
        if let Ok(val) = std::env::var("OTTER_LISTEN_PORT") {
            if let Ok(n) = val.parse() {
                self.node.listen_port = n;
            }
        }
        if let Ok(val) = std::env::var("SERVICE_NAME") {
            self.node.service_name = Some(val);
        }
        if let Ok(val) = std::env::var("OTTER_ADVERTISE_ADDRESS") {
            if let Ok(addr) = val.parse() {
                self.node.advertise_address = Some(addr);
            }
        }

        // Registry settings
        if let Ok(val) = std::env::var("OTTER_REGISTRY_URL") {
            self.registry.url = val;
        }
        if let Ok(val) = std::env::var("OTTER_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.registry.poll_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("OTTER_DEREGISTER_ON_SHUTDOWN") {
            self.registry.deregister_on_shutdown = parse_bool(&val);
        }

        // Dispatch settings
        if let Ok(val) = std::env::var("OTTER_TARGET_ROLES") {
            self.dispatch.target_roles = split_list(&val);
        }
        if let Ok(val) = std::env::var("OTTER_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.dispatch.connect_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("OTTER_RETRY_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.dispatch.retry_delay_ms = n;
            }
        }

        // Receiver settings
        if let Ok(val) = std::env::var("OTTER_MAX_FRAME_BYTES") {
            if let Ok(n) = val.parse() {
                self.receiver.max_frame_bytes = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("OTTER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("OTTER_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("OTTER_LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.node.container_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {}
            _ => {
                return Err(Error::config_field_invalid(
                    "node.container_name",
                    "node.container_name is required (set it in the config file or OTTER_CONTAINER_NAME)",
                ))
            }
        }
        if self.node.role.trim().is_empty() {
            return Err(Error::config_field_invalid("node.role", "node.role cannot be empty"));
        }
        if self.node.listen_host.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "node.listen_host",
                "node.listen_host cannot be empty",
            ));
        }

        // Validate registry URL
        let url = Url::parse(&self.registry.url).map_err(|e| {
            Error::config_field_invalid(
                "registry.url",
                format!("Invalid registry URL '{}': {}", self.registry.url, e),
            )
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::config_field_invalid(
                "registry.url",
                "Registry URL must start with http:// or https://",
            ));
        }

        let intervals = [
            ("registry.poll_interval_ms", self.registry.poll_interval_ms),
            ("registry.request_timeout_ms", self.registry.request_timeout_ms),
            ("dispatch.connect_timeout_ms", self.dispatch.connect_timeout_ms),
            ("dispatch.retry_delay_ms", self.dispatch.retry_delay_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(Error::config_field_invalid(
                    field,
                    format!("{} must be greater than 0", field),
                ));
            }
        }

        let checks = [
            ("registry.check_interval", &self.registry.check_interval),
            ("registry.check_timeout", &self.registry.check_timeout),
            ("registry.deregister_after", &self.registry.deregister_after),
        ];
        for (field, value) in checks {
            if value.trim().is_empty() {
                return Err(Error::config_field_invalid(
                    field,
                    format!("{} cannot be empty", field),
                ));
            }
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Registry service ID: configured, else the host name
    pub fn node_id(&self) -> String {
        self.node
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_node_id)
    }

    /// Container name, empty when unset
    pub fn container_name(&self) -> &str {
        self.node.container_name.as_deref().unwrap_or_default()
    }
}

/// Split a comma-separated list, dropping empty items
fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Write a commented default configuration file and return its path
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".otter")
                .join("node.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Otter Node Configuration

[node]
# Registry service ID (defaults to the host name)
# id = "node-1"

# Container name: announced to the registry and sent with every batch
container_name = "node"

# Role of this node (first registry tag)
role = "default_role"

# Compute device (second registry tag)
device = "CPU"

# Additional registry tags
tags = []

# Receiver bind address and port (0 = ephemeral)
listen_host = "0.0.0.0"
listen_port = 5000

# DNS name resolved for the advertised address (overridden by SERVICE_NAME)
# service_name = "otter_node"

# Skip resolution and advertise this address
# advertise_address = "10.0.0.5"

[registry]
# Registry agent HTTP URL
url = "http://127.0.0.1:8500"

# Discovery poll interval in milliseconds
poll_interval_ms = 5000

# HTTP request timeout in milliseconds
request_timeout_ms = 5000

# TCP health check settings
check_interval = "5s"
check_timeout = "1s"
deregister_after = "10s"

# Remove this node from the registry on shutdown
deregister_on_shutdown = true

[dispatch]
# Roles of the peers that receive our data
target_roles = []

# Peer connect timeout in milliseconds
connect_timeout_ms = 10000

# Delay between delivery attempts in milliseconds
retry_delay_ms = 3000

[receiver]
# Maximum accepted payload size in bytes (0 = unbounded)
max_frame_bytes = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.otter/logs/node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
