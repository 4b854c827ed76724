//! Broker connection addresses.
//!
//! A single configuration string resolves to either a TCP endpoint or a local
//! (Unix domain) socket path:
//!
//! - `"45454"`: TCP port on [`DEFAULT_HOST`]
//! - `"host:45454"`: TCP endpoint, split on the last colon
//! - `"/run/user/1000/ipcbus.sock"` or any other non-numeric string: local socket path

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// Host used when an address names only a port.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port used by [`Address::default`].
pub const DEFAULT_PORT: u16 = 45454;

/// Where the broker listens and peers connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    Tcp { host: String, port: u16 },
    Local(PathBuf),
}

impl Address {
    /// Parses an address from its configuration string.
    pub fn parse(input: &str) -> DomainResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_address(input, "empty address"));
        }

        if is_digits(trimmed) {
            return Ok(Self::Tcp {
                host: DEFAULT_HOST.to_string(),
                port: parse_port(input, trimmed)?,
            });
        }

        if trimmed.contains('/') || trimmed.contains('\\') {
            return Ok(Self::Local(PathBuf::from(trimmed)));
        }

        if let Some((host, port)) = trimmed.rsplit_once(':') {
            if !is_digits(port) {
                return Err(DomainError::invalid_address(
                    input,
                    format!("port '{port}' is not a number"),
                ));
            }
            let host = if host.is_empty() { DEFAULT_HOST } else { host };
            return Ok(Self::Tcp {
                host: host.to_string(),
                port: parse_port(input, port)?,
            });
        }

        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    /// Builds a TCP address on the default host.
    pub fn tcp_port(port: u16) -> Self {
        Self::Tcp {
            host: DEFAULT_HOST.to_string(),
            port,
        }
    }

    /// Returns true for local socket addresses.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(input: &str, port: &str) -> DomainResult<u16> {
    port.parse::<u16>()
        .map_err(|_| DomainError::invalid_address(input, format!("port '{port}' out of range")))
}

impl Default for Address {
    fn default() -> Self {
        Self::tcp_port(DEFAULT_PORT)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Address {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}
