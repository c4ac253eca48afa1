//! iofwd session configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::FRAME_HEADER_SIZE;

/// Default configuration constants
///
/// All defaults live here so that the launcher, the TOML loader and the
/// tests agree on them.
pub mod defaults {
    // Placement defaults
    pub const CLIENT_X: usize = 4;
    pub const CLIENT_Y: usize = 4;

    /// Clients per server
    pub const RATIO: usize = 8;

    // Buffer defaults
    /// Client ring capacity: 16MB
    pub const CLIENT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

    /// Receive capacity per server, shared by its clients: 64MB
    pub const SERVER_BUFFER_SIZE: usize = 64 * 1024 * 1024;

    /// Preferred upper bound of a single message: 512KB
    pub const MSG_BUFFER_SIZE: usize = 512 * 1024;

    /// Bytes all clients together should be able to keep in flight: 70MB
    pub const SEND_MSG_MIN_SIZE: usize = 70 * 1024 * 1024;

    // Transport defaults
    /// Maximum reads in flight per server (0 = one per client)
    pub const MAX_CONCURRENT_TRANSFERS: usize = 0;

    /// Blocking poll timeout used to re-check stop flags
    pub const POLL_INTERVAL_MS: u64 = 100;

    // Storage defaults
    pub const fn default_output_dir() -> &'static str {
        "/tmp/iofwd"
    }

    // Log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// iofwd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IofwdConfig {
    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub buffers: BufferConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client grid and the desired clients per server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_client_x")]
    pub client_x: usize,

    #[serde(default = "default_client_y")]
    pub client_y: usize,

    /// Desired number of clients per server
    #[serde(default = "default_ratio")]
    pub ratio: usize,
}

fn default_client_x() -> usize {
    defaults::CLIENT_X
}

fn default_client_y() -> usize {
    defaults::CLIENT_Y
}

fn default_ratio() -> usize {
    defaults::RATIO
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            client_x: default_client_x(),
            client_y: default_client_y(),
            ratio: default_ratio(),
        }
    }
}

/// Ring and message sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Client ring capacity in bytes
    #[serde(default = "default_client_buffer_size")]
    pub client_buffer_size: usize,

    /// Receive capacity of a server in bytes, split evenly across its clients
    #[serde(default = "default_server_buffer_size")]
    pub server_buffer_size: usize,

    #[serde(default = "default_msg_buffer_size")]
    pub msg_buffer_size: usize,

    #[serde(default = "default_send_msg_min_size")]
    pub send_msg_min_size: usize,
}

fn default_client_buffer_size() -> usize {
    defaults::CLIENT_BUFFER_SIZE
}

fn default_server_buffer_size() -> usize {
    defaults::SERVER_BUFFER_SIZE
}

fn default_msg_buffer_size() -> usize {
    defaults::MSG_BUFFER_SIZE
}

fn default_send_msg_min_size() -> usize {
    defaults::SEND_MSG_MIN_SIZE
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            client_buffer_size: default_client_buffer_size(),
            server_buffer_size: default_server_buffer_size(),
            msg_buffer_size: default_msg_buffer_size(),
            send_msg_min_size: default_send_msg_min_size(),
        }
    }
}

impl BufferConfig {
    /// Receive ring capacity for each client of a server.
    pub fn server_region_size(&self, clients_per_server: usize) -> usize {
        self.server_buffer_size / clients_per_server.max(1)
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Reads a server keeps in flight before draining completions
    /// (0 = number of clients of the server)
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_concurrent_transfers() -> usize {
    defaults::MAX_CONCURRENT_TRANSFERS
}

fn default_poll_interval_ms() -> u64 {
    defaults::POLL_INTERVAL_MS
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TransportConfig {
    pub fn transfer_limit(&self, clients_per_server: usize) -> usize {
        if self.max_concurrent_transfers == 0 {
            clients_per_server.max(1)
        } else {
            self.max_concurrent_transfers
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Datasets kept in process memory
    #[default]
    Memory,
    /// One directory per dataset under `output_dir`
    Directory,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Root for the directory backend
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(defaults::default_output_dir())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl PlacementConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_x == 0 || self.client_y == 0 {
            return Err(ConfigError::invalid(
                "placement",
                format!("client grid {}x{} is empty", self.client_x, self.client_y),
            ));
        }
        if self.ratio == 0 {
            return Err(ConfigError::invalid("placement", "ratio must be at least 1"));
        }
        Ok(())
    }
}

impl BufferConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // One header-only frame plus the reserved byte.
        let ring_minimum = FRAME_HEADER_SIZE + 1;
        for (key, size) in [
            ("client_buffer_size", self.client_buffer_size),
            ("server_buffer_size", self.server_buffer_size),
        ] {
            if size < ring_minimum {
                return Err(ConfigError::invalid(
                    "buffers",
                    format!("{} = {} is below {} bytes", key, size, ring_minimum),
                ));
            }
        }
        if self.msg_buffer_size < FRAME_HEADER_SIZE {
            return Err(ConfigError::invalid(
                "buffers",
                format!(
                    "msg_buffer_size = {} cannot hold a frame header",
                    self.msg_buffer_size
                ),
            ));
        }
        Ok(())
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("transport", "poll_interval_ms must be at least 1"));
        }
        Ok(())
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::invalid(
                "logging",
                format!("unknown level {:?}", other),
            )),
        }
    }
}

impl IofwdConfig {
    /// Parse a session configuration. Missing sections and keys take their
    /// defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: IofwdConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Write the effective configuration, defaults included, so a session
    /// can be rerun with exactly the same settings.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.placement.validate()?;
        self.buffers.validate()?;
        self.transport.validate()?;
        self.logging.validate()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("[{section}] {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            section,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IofwdConfig::default();
        assert_eq!(config.placement.ratio, 8);
        assert_eq!(config.buffers.msg_buffer_size, 512 * 1024);
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = IofwdConfig::default();

        config.placement.client_y = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                section: "placement",
                ..
            })
        ));
        config.placement.client_y = 4;

        config.placement.ratio = 0;
        assert!(config.validate().is_err());
        config.placement.ratio = 2;

        config.buffers.client_buffer_size = FRAME_HEADER_SIZE;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_buffer_size"));
        config.buffers.client_buffer_size = 4096;

        config.logging.level = "invalid".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                section: "logging",
                ..
            })
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = IofwdConfig::parse(
            r#"
            [placement]
            client_x = 6

            [storage]
            backend = "directory"
            output_dir = "/scratch/out"
            "#,
        )
        .unwrap();

        assert_eq!(config.placement.client_x, 6);
        assert_eq!(config.placement.client_y, defaults::CLIENT_Y);
        assert_eq!(config.storage.backend, BackendKind::Directory);
        assert_eq!(config.storage.output_dir, PathBuf::from("/scratch/out"));
        assert_eq!(config.transport.poll_interval_ms, defaults::POLL_INTERVAL_MS);
    }

    #[test]
    fn test_derived_sizes() {
        let config = IofwdConfig::default();
        assert_eq!(config.buffers.server_region_size(8), 8 * 1024 * 1024);
        assert_eq!(config.transport.transfer_limit(8), 8);

        let transport = TransportConfig {
            max_concurrent_transfers: 3,
            ..TransportConfig::default()
        };
        assert_eq!(transport.transfer_limit(8), 3);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            IofwdConfig::parse("[placement]\nclient_x = \"four\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            IofwdConfig::parse("[transport]\npoll_interval_ms = 0"),
            Err(ConfigError::Invalid {
                section: "transport",
                ..
            })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iofwd.toml");

        let mut config = IofwdConfig::default();
        config.placement.client_x = 2;
        config.storage.backend = BackendKind::Directory;
        config.save(&path).unwrap();
        assert_eq!(IofwdConfig::load(&path).unwrap(), config);

        let missing = dir.path().join("missing.toml");
        match IofwdConfig::load(&missing) {
            Err(ConfigError::Read { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected read error, got {:?}", other),
        }
    }
}
