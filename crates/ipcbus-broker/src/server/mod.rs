//! Socket server for the broker.
//!
//! The server:
//! - Listens on a TCP or Unix socket address
//! - Spawns a ConnectionHandler for each accepted stream
//! - Accepts any other `AsyncRead + AsyncWrite` stream through `serve_stream`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  BrokerServer   │
//! │                 │
//! │ Tcp/UnixListener│     serve_stream(duplex)
//! └───────┬─────────┘            │
//!         │ accept()             │
//!         ▼                      ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  BrokerHandle   │
//! │ (per connection)│     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and the server keeps accepting

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ipcbus_core::Address;

use crate::config::BrokerConfig;
use crate::registry::{BrokerHandle, ConnKey};

/// A bound listening socket.
pub enum BrokerListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl BrokerListener {
    /// Binds `address`, removing a stale socket file first for local addresses.
    pub async fn bind(address: &Address) -> Result<Self, ServerError> {
        match address {
            Address::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|e| ServerError::Bind {
                        address: address.to_string(),
                        error: e.to_string(),
                    })?;
                Ok(Self::Tcp(listener))
            }
            Address::Local(path) => {
                let setup = |e: std::io::Error| ServerError::Bind {
                    address: address.to_string(),
                    error: e.to_string(),
                };
                if path.exists() {
                    std::fs::remove_file(path).map_err(setup)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(setup)?;
                    }
                }
                let listener = UnixListener::bind(path).map_err(setup)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The address actually bound. For TCP port 0 this carries the real port.
    pub fn local_address(&self) -> Result<Address, ServerError> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr().map_err(|e| ServerError::Bind {
                    address: "tcp".to_string(),
                    error: e.to_string(),
                })?;
                Ok(Address::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            Self::Unix { path, .. } => Ok(Address::Local(path.clone())),
        }
    }
}

/// The broker's socket server.
pub struct BrokerServer {
    config: BrokerConfig,
    broker: BrokerHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig, broker: BrokerHandle, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            broker,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = BrokerListener::bind(&self.config.address).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the cancellation token fires.
    pub async fn serve(&self, listener: BrokerListener) -> Result<(), ServerError> {
        info!(address = %self.config.address, "Broker server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                accepted = accept(&listener) => {
                    match accepted {
                        Ok(Accepted::Tcp(stream)) => {
                            let _ = stream.set_nodelay(true);
                            self.admit(stream);
                        }
                        Ok(Accepted::Unix(stream)) => self.admit(stream),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup(&listener);
        Ok(())
    }

    /// Serves an already-open stream, e.g. one end of `tokio::io::duplex`.
    ///
    /// Bypasses the connection limit.
    pub fn serve_stream<S>(&self, stream: S) -> JoinHandle<Result<(), ConnectionError>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.next_conn();
        let handler = ConnectionHandler::new(
            stream,
            conn,
            self.broker.clone(),
            self.config.max_packet_size,
            self.config.write_timeout(),
            self.cancel_token.child_token(),
        );
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let result = handler.run().await;
            active.fetch_sub(1, Ordering::Relaxed);
            result
        })
    }

    fn admit<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let active = self.active_connections();
        if active >= self.config.max_connections {
            warn!(
                active,
                max = self.config.max_connections,
                "Connection limit reached, rejecting connection"
            );
            return;
        }
        let _ = self.serve_stream(stream);
    }

    fn next_conn(&self) -> ConnKey {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn cleanup(&self, listener: &BrokerListener) {
        if let BrokerListener::Unix { path, .. } = listener {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
        debug!("Server cleanup complete");
    }
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &BrokerListener) -> std::io::Result<Accepted> {
    match listener {
        BrokerListener::Tcp(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
        BrokerListener::Unix { listener, .. } => {
            listener.accept().await.map(|(s, _)| Accepted::Unix(s))
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {error}")]
    Bind { address: String, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
