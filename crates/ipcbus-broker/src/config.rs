//! Broker configuration.
//!
//! Sources, later ones winning:
//!
//! 1. built-in defaults
//! 2. a TOML file: `--config <path>`, else `<config dir>/ipcbus/broker.toml`
//!    when it exists
//! 3. the `IPCBUS_ADDRESS` environment variable
//! 4. command-line flags (applied by the binary)
//!
//! ```toml
//! address = "/run/user/1000/ipcbus.sock"
//! max_connections = 256
//! max_packet_size = 67108864
//! write_timeout_ms = 10000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ipcbus_core::{Address, DomainError};
use ipcbus_protocol::DEFAULT_MAX_PACKET_SIZE;

/// Environment variable overriding the broker address.
pub const ADDRESS_ENV: &str = "IPCBUS_ADDRESS";

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Default write timeout per frame (10 seconds).
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Where to listen
    pub address: Address,

    /// Connections beyond this are closed right after accept
    pub max_connections: usize,

    /// Largest packet a peer may send before its connection is closed
    pub max_packet_size: usize,

    /// How long one frame write may take before the connection is dropped
    pub write_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: Address::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

impl BrokerConfig {
    /// `<config dir>/ipcbus/broker.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ipcbus").join("broker.toml"))
    }

    /// Reads a config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&text).map_err(|error| match error {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Loads the configuration from files and the environment.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.override_address(std::env::var(ADDRESS_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Replaces the address when `value` is set and not blank.
    pub fn override_address(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            self.address = Address::parse(value)?;
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error(transparent)]
    Address(#[from] DomainError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.address.to_string(), "127.0.0.1:45454");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.max_packet_size, 64 * 1024 * 1024);
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BrokerConfig::from_toml("address = \"/tmp/bus.sock\"\n").unwrap();
        assert!(config.address.is_local());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_bad_address_in_toml() {
        let err = BrokerConfig::from_toml("address = \"host:port\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address = \"9000\"\nmax_connections = 4").unwrap();
        let config = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.address, Address::tcp_port(9000));
        assert_eq!(config.max_connections, 4);

        let missing = BrokerConfig::from_file(Path::new("/nonexistent/ipcbus.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_override_address() {
        let mut config = BrokerConfig::default();
        config.override_address(None).unwrap();
        config.override_address(Some("  ")).unwrap();
        assert_eq!(config.address, Address::default());

        config.override_address(Some("localhost:7000")).unwrap();
        assert_eq!(config.address.to_string(), "localhost:7000");
        assert!(config.override_address(Some("x:y")).is_err());
    }
}
