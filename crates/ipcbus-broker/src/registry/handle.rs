//! Client interface for the BrokerActor.
//!
//! `BrokerHandle` is cheap to clone; every connection task holds one.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `BrokerError::ChannelClosed`

use tokio::sync::{mpsc, oneshot};

use ipcbus_core::StateRecord;
use ipcbus_protocol::CommandFrame;

use super::channels::ConnKey;
use super::commands::{BrokerCommand, BrokerError, BrokerStats, FrameSink};

// ============================================================================
// Broker Handle
// ============================================================================

/// Handle for talking to the broker actor.
///
/// # Usage
///
/// ```ignore
/// let broker = spawn_broker();
///
/// // Per connection
/// broker.attach(conn, sink).await?;
/// broker.frame(conn, frame).await?;
/// broker.detach(conn).await?;
///
/// // Diagnostics
/// let records = broker.query_state(None).await?;
/// ```
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(sender: mpsc::Sender<BrokerCommand>) -> Self {
        Self { sender }
    }

    /// Registers a connection and the sink its frames are written to.
    pub async fn attach(&self, conn: ConnKey, sink: FrameSink) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Attach { conn, sink }).await
    }

    /// Hands a received frame to the broker.
    ///
    /// Waits for queue space, so a fast sender is slowed to the broker's pace.
    pub async fn frame(&self, conn: ConnKey, frame: CommandFrame) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Frame { conn, frame }).await
    }

    /// Releases everything the connection owned.
    pub async fn detach(&self, conn: ConnKey) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Detach { conn }).await
    }

    /// Returns the current subscriptions, optionally for one channel only.
    pub async fn query_state(&self, channel: Option<String>) -> Result<Vec<StateRecord>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.send(BrokerCommand::QueryState {
            channel,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.send(BrokerCommand::Stats { respond_to: tx }).await?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    async fn send(&self, cmd: BrokerCommand) -> Result<(), BrokerError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }
}
