//! Peer configuration.

use std::time::Duration;

use ipcbus_core::{Address, ProcessKind};
use ipcbus_protocol::DEFAULT_MAX_PACKET_SIZE;

use crate::error::Result;

/// Environment variable naming the broker address.
pub const ADDRESS_ENV: &str = "IPCBUS_ADDRESS";

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff between connection attempts.
///
/// # Example
///
/// ```rust
/// use ipcbus_peer::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     initial_delay: Duration::from_millis(50),
///     ..Default::default()
/// };
/// assert_eq!(policy.next_delay(Duration::from_millis(50)), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to use after `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

// ============================================================================
// Peer Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Broker address.
    pub address: Address,

    /// Human readable peer name, shown in broker state dumps.
    pub name: String,

    /// Kind of process this peer lives in.
    pub process_kind: ProcessKind,

    /// Reconnect policy used by `connect`.
    pub retry: RetryPolicy,

    /// Largest packet accepted from the broker.
    pub max_packet_size: usize,

    /// Timeout for `query_state`.
    pub query_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: Address::default(),
            name: "ipcbus-peer".to_string(),
            process_kind: ProcessKind::Node,
            retry: RetryPolicy::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl PeerConfig {
    /// Defaults, with the address taken from `IPCBUS_ADDRESS` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(ADDRESS_ENV) {
            if !value.trim().is_empty() {
                config.address = Address::parse(&value)?;
            }
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 10.0,
        };
        let d2 = policy.next_delay(policy.initial_delay);
        assert_eq!(d2, Duration::from_secs(10));
        assert_eq!(policy.next_delay(d2), Duration::from_secs(10));
    }

    #[test]
    fn test_peer_config_builders() {
        let config = PeerConfig::default()
            .with_name("editor")
            .with_address(Address::tcp_port(1234));
        assert_eq!(config.name, "editor");
        assert_eq!(config.address.to_string(), "127.0.0.1:1234");
        assert_eq!(config.process_kind, ProcessKind::Node);
    }
}
