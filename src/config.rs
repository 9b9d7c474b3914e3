//! Configuration system for the Shoal worker
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (SHOAL_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logging::SUBSYSTEMS;
use crate::peer::{ConnectorSetting, WorkerId, WorkerPeer, PROSPECTIVE_WORKER_ID};

/// Main worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity
    pub worker: WorkerSettings,

    /// Local interfaces (transports) this worker listens and connects through
    pub interfaces: Vec<InterfaceSettings>,

    /// Known peers of the shoal
    pub peers: Vec<PeerSettings>,

    /// Worker socket limits
    pub worker_socket: WorkerSocketSettings,

    /// Worker group channel settings
    pub group: GroupSettings,

    /// Defaults for absence tolerance record commissions
    pub commission: CommissionSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Worker identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker id (0 = not yet a member; join through an existing worker)
    pub id: WorkerId,

    /// Hex-encoded authenticity data of this worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticity_data: Option<String>,

    /// How other workers reach this one
    pub connectors: Vec<ConnectorSetting>,

    /// Free-form metadata published to other members
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,

    /// Path to the 4096-byte static global random seed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<String>,

    /// Shared token a prospective worker presents to be admitted. Members
    /// without one admit nobody; a prospective worker sends its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,
}

/// One local interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Interface name that connectors refer to
    pub name: String,

    /// Transport kind; `tcp` is the only one available from a config file
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Listen settings (e.g. `{ address = "0.0.0.0:7400" }`); absent = connect only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// One known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    pub worker_id: WorkerId,

    /// Hex-encoded authenticity data of the peer
    pub authenticity_data: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,

    #[serde(default)]
    pub connectors: Vec<ConnectorSetting>,
}

/// Worker socket limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSocketSettings {
    /// Largest encoded frame a socket sends
    pub max_frame_bytes: usize,
}

/// Worker group channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    /// Times a multicast responder may ask to retry one peer
    pub max_request_retries: u32,
}

/// Commission defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionSettings {
    /// Replication interval in milliseconds
    pub update_rate_ms: u64,

    /// Percentage of commission peers that must acknowledge an update
    pub min_successful_update_rate: u8,
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

    /// When the log file rolls over: hourly, daily or never
    pub rotation: String,

    /// Number of rolled-over log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,

    /// Level per subsystem (`socket = "debug"`), below the global level or above it
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, String>,
}

// Default implementations

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for WorkerSocketSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
        }
    }
}

impl Default for CommissionSettings {
    fn default() -> Self {
        Self {
            update_rate_ms: 1000,
            min_successful_update_rate: 51,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
            modules: BTreeMap::new(),
        }
    }
}

impl PeerSettings {
    /// Directory entry for this peer
    pub fn to_worker_peer(&self) -> Result<WorkerPeer> {
        let authenticity_data = decode_hex("peers.authenticity_data", &self.authenticity_data)?;
        Ok(WorkerPeer {
            worker_id: self.worker_id,
            connectors: self.connectors.clone(),
            detail: self.detail.clone(),
            authenticity_data,
            pairwise_key: Vec::new(),
        })
    }
}

impl WorkerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::ConfigNotFound { path })
            };
        }

        let search_paths = [
            PathBuf::from("shoal-worker.toml"),
            dirs::config_dir()
                .map(|p| p.join("shoal").join("worker.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".shoal").join("worker.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/shoal/worker.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("SHOAL_WORKER_ID") {
            self.worker.id = n;
        }
        if let Ok(val) = std::env::var("SHOAL_AUTHENTICITY_DATA") {
            self.worker.authenticity_data = Some(val);
        }
        if let Ok(val) = std::env::var("SHOAL_SEED_FILE") {
            self.worker.seed_file = Some(val);
        }
        if let Ok(val) = std::env::var("SHOAL_JOIN_TOKEN") {
            self.worker.join_token = Some(val);
        }

        if let Some(n) = env_parse("SHOAL_MAX_FRAME_BYTES") {
            self.worker_socket.max_frame_bytes = n;
        }
        if let Some(n) = env_parse("SHOAL_MAX_REQUEST_RETRIES") {
            self.group.max_request_retries = n;
        }
        if let Some(n) = env_parse("SHOAL_UPDATE_RATE_MS") {
            self.commission.update_rate_ms = n;
        }
        if let Some(n) = env_parse("SHOAL_MIN_SUCCESSFUL_UPDATE_RATE") {
            self.commission.min_successful_update_rate = n;
        }

        if let Ok(val) = std::env::var("SHOAL_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("SHOAL_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("SHOAL_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
        if let Some(ref seed) = self.worker.seed_file {
            self.worker.seed_file = Some(expand_path(seed));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let check_level = |field: String, level: &str| {
            if valid_levels.contains(&level.to_lowercase().as_str()) {
                Ok(())
            } else {
                Err(Error::config_field_invalid(
                    field,
                    format!(
                        "Invalid log level '{}'. Must be one of: {}",
                        level,
                        valid_levels.join(", ")
                    ),
                ))
            }
        };
        check_level("logging.level".to_string(), &self.logging.level)?;
        for (module, level) in &self.logging.modules {
            if !SUBSYSTEMS.contains(&module.as_str()) {
                return Err(Error::config_field_invalid(
                    "logging.modules",
                    format!(
                        "Unknown subsystem '{}'. Must be one of: {}",
                        module,
                        SUBSYSTEMS.join(", ")
                    ),
                ));
            }
            check_level(format!("logging.modules.{}", module), level)?;
        }
        if !["hourly", "daily", "never"].contains(&self.logging.rotation.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.rotation",
                "must be one of: hourly, daily, never",
            ));
        }

        if self.commission.min_successful_update_rate > 100 {
            return Err(Error::config_field_invalid(
                "commission.min_successful_update_rate",
                "must be between 0 and 100",
            ));
        }
        if self.commission.update_rate_ms == 0 {
            return Err(Error::config_field_invalid(
                "commission.update_rate_ms",
                "must be positive",
            ));
        }
        if self.worker_socket.max_frame_bytes == 0 {
            return Err(Error::config_field_invalid(
                "worker_socket.max_frame_bytes",
                "must be positive",
            ));
        }

        if let Some(data) = &self.worker.authenticity_data {
            decode_hex("worker.authenticity_data", data)?;
        }
        if self.worker.id != PROSPECTIVE_WORKER_ID && self.worker.authenticity_data.is_none() {
            return Err(Error::config_field_invalid(
                "worker.authenticity_data",
                format!("worker {} needs its authenticity data", self.worker.id),
            ));
        }

        if self.worker.join_token.as_deref().is_some_and(str::is_empty) {
            return Err(Error::config_field_invalid(
                "worker.join_token",
                "must not be empty; remove it to admit nobody",
            ));
        }

        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if !names.insert(interface.name.as_str()) {
                return Err(Error::config_field_invalid(
                    "interfaces.name",
                    format!("interface '{}' is defined twice", interface.name),
                ));
            }
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.worker_id == PROSPECTIVE_WORKER_ID {
                return Err(Error::config_field_invalid(
                    "peers.worker_id",
                    "worker id 0 is reserved for prospective joiners",
                ));
            }
            if !seen.insert(peer.worker_id) {
                return Err(Error::config_field_invalid(
                    "peers.worker_id",
                    format!("worker {} is listed twice", peer.worker_id),
                ));
            }
            decode_hex("peers.authenticity_data", &peer.authenticity_data)?;
        }

        Ok(())
    }

    /// The local authenticity data, decoded
    pub fn authenticity_data(&self) -> Result<Option<Vec<u8>>> {
        self.worker
            .authenticity_data
            .as_deref()
            .map(|data| decode_hex("worker.authenticity_data", data))
            .transpose()
    }

    /// The `[[peers]]` table as directory entries
    pub fn peer_map(&self) -> Result<BTreeMap<WorkerId, WorkerPeer>> {
        self.peers
            .iter()
            .map(|p| Ok((p.worker_id, p.to_worker_peer()?)))
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

fn decode_hex(field: &str, text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim())
        .map_err(|e| Error::config_field_invalid(field, format!("invalid hex: {}", e)))
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".shoal")
                .join("worker.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Shoal Worker Configuration

[worker]
# Worker id; 0 means this worker still has to join a shoal
id = 0

# Hex-encoded authenticity data (required when id is not 0)
# authenticity_data = "00112233..."

# Path to the shared 4096-byte random seed (`shoal-worker seed generate`)
# seed_file = "~/.shoal/seed.bin"

# Token prospective workers must present to join through this one
# join_token = "change-me"

# How other workers reach this one
# [[worker.connectors]]
# interface = "tcp"
# settings = { address = "192.0.2.10:7400" }

# Local interfaces
# [[interfaces]]
# name = "tcp"
# transport = "tcp"
# settings = { address = "0.0.0.0:7400" }
# connect_timeout_ms = 10000

# Known peers
# [[peers]]
# worker_id = 2
# authenticity_data = "44556677..."
# connectors = [{ interface = "tcp", settings = { address = "192.0.2.11:7400" } }]

[worker_socket]
# Largest encoded frame a socket sends, in bytes
max_frame_bytes = 16777216

[group]
# Times a multicast responder may ask to retry one peer
max_request_retries = 3

[commission]
# Replication interval in milliseconds
update_rate_ms = 1000

# Percentage of commission peers that must acknowledge an update
min_successful_update_rate = 51

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.shoal/logs/worker.log"

# When the log file rolls over: hourly, daily or never
rotation = "daily"

# Number of rolled-over log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false

# Per-subsystem levels: tunnel, protocol, socket, group, commission, membership, peer
# [logging.modules]
# commission = "debug"
# tunnel = "warn"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker.id, 0);
        assert_eq!(config.commission.min_successful_update_rate, 51);
        assert_eq!(config.group.max_request_retries, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("SHOAL_MAX_REQUEST_RETRIES", "7");
        env::set_var("SHOAL_UPDATE_RATE_MS", "250");

        let mut config = WorkerConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.group.max_request_retries, 7);
        assert_eq!(config.commission.update_rate_ms, 250);

        env::remove_var("SHOAL_MAX_REQUEST_RETRIES");
        env::remove_var("SHOAL_UPDATE_RATE_MS");
    }

    #[test]
    fn test_validation_invalid_rate() {
        let mut config = WorkerConfig::default();
        config.commission.min_successful_update_rate = 150;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.commission.update_rate_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = WorkerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_logging_modules() {
        let mut config = WorkerConfig::default();
        config
            .logging
            .modules
            .insert("commission".to_string(), "debug".to_string());
        assert!(config.validate().is_ok());

        config
            .logging
            .modules
            .insert("scheduler".to_string(), "debug".to_string());
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config
            .logging
            .modules
            .insert("socket".to_string(), "chatty".to_string());
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.logging.rotation = "weekly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_peers() {
        let peer = |worker_id, data: &str| PeerSettings {
            worker_id,
            authenticity_data: data.to_string(),
            detail: Value::Null,
            connectors: vec![],
        };

        let mut config = WorkerConfig::default();
        config.peers = vec![peer(2, "aa"), peer(2, "bb")];
        assert!(config.validate().is_err());

        config.peers = vec![peer(0, "aa")];
        assert!(config.validate().is_err());

        config.peers = vec![peer(2, "not-hex")];
        assert!(config.validate().is_err());

        config.peers = vec![peer(2, "aa"), peer(3, "bb")];
        assert!(config.validate().is_ok());
        assert_eq!(config.peer_map().unwrap()[&3].authenticity_data, vec![0xbb]);
    }

    #[test]
    fn test_member_needs_authenticity_data() {
        let mut config = WorkerConfig::default();
        config.worker.id = 4;
        assert!(config.validate().is_err());

        config.worker.authenticity_data = Some("0a0b".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.authenticity_data().unwrap(), Some(vec![0x0a, 0x0b]));
    }

    #[test]
    fn test_empty_join_token_rejected() {
        let mut config = WorkerConfig::default();
        config.worker.join_token = Some(String::new());
        assert!(config.validate().is_err());

        config.worker.join_token = Some("harbour".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_valid_config() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = WorkerConfig::default();
        config.worker.seed_file = Some("~/shoal/seed.bin".to_string());
        config.expand_paths();

        assert!(!config.worker.seed_file.unwrap().contains('~'));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = WorkerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: WorkerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.commission.update_rate_ms, parsed.commission.update_rate_ms);
        assert_eq!(config.worker_socket.max_frame_bytes, parsed.worker_socket.max_frame_bytes);
    }

    #[test]
    fn test_default_file_parses() {
        let parsed: WorkerConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[worker]
id = 1
authenticity_data = "0102"
seed_file = "/tmp/seed.bin"

[[worker.connectors]]
interface = "tcp"
settings = { address = "127.0.0.1:7400" }

[[interfaces]]
name = "tcp"
settings = { address = "0.0.0.0:7400" }

[[peers]]
worker_id = 2
authenticity_data = "0304"
connectors = [{ interface = "tcp", settings = { address = "127.0.0.1:7401" } }]

[commission]
update_rate_ms = 500
min_successful_update_rate = 60

[logging]
level = "debug"
"#;

        let config: WorkerConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.worker.id, 1);
        assert_eq!(config.worker.connectors[0].interface, "tcp");
        assert_eq!(config.interfaces[0].transport, "tcp");
        assert_eq!(config.interfaces[0].connect_timeout_ms, 10_000);
        assert_eq!(
            config.peers[0].connectors[0].settings["address"],
            "127.0.0.1:7401"
        );
        assert_eq!(config.commission.min_successful_update_rate, 60);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }
}
