//! Connection supervisor: reaches the broker, retrying with backoff.
//!
//! The supervisor only produces connected streams. Framing, dispatch and
//! request correlation live in [`crate::peer`] and never see a retry.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use ipcbus_core::Address;

use crate::config::RetryPolicy;
use crate::error::{PeerError, Result};

/// Any bidirectional byte stream a peer can run over.
pub trait BusStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BusStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owns the reconnect policy for one broker address.
#[derive(Debug, Clone)]
pub struct Supervisor {
    address: Address,
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(address: Address, policy: RetryPolicy) -> Self {
        Self { address, policy }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// One connection attempt, no retry.
    pub async fn connect_once(&self) -> io::Result<Box<dyn BusStream>> {
        match &self.address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Address::Local(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }

    /// Retries with exponential backoff until a connection succeeds or
    /// `timeout` has elapsed.
    pub async fn connect(&self, timeout: Duration) -> Result<Box<dyn BusStream>> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, address = %self.address, "Attempting to connect to broker");

            let reason = match tokio::time::timeout_at(deadline, self.connect_once()).await {
                Ok(Ok(stream)) => {
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    if attempt == 1 {
                        warn!(address = %self.address, error = %e, "Broker not reachable, will retry");
                    }
                    e.to_string()
                }
                Err(_) => "connect attempt timed out".to_string(),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(PeerError::ConnectTimeout {
                    address: self.address.to_string(),
                    timeout,
                    reason,
                });
            }
            sleep(delay.min(deadline - now)).await;
            delay = self.policy.next_delay(delay);
        }
    }
}
