//! Broker actor commands and errors.
//!
//! - `BrokerCommand`: messages sent to the `BrokerActor`
//! - `BrokerError`: failures talking to the actor
//! - `BrokerStats`: counters for diagnostics and tests

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use ipcbus_core::StateRecord;
use ipcbus_protocol::CommandFrame;

use super::channels::ConnKey;

/// Queue of encoded frames drained by one connection's writer task.
pub type FrameSink = mpsc::UnboundedSender<Bytes>;

// ============================================================================
// Broker Commands
// ============================================================================

/// Commands sent to the broker actor.
///
/// Connection tasks send `Attach`, `Frame` and `Detach` in that order for
/// each connection; queries carry a oneshot for the answer.
#[derive(Debug)]
pub enum BrokerCommand {
    /// A connection was accepted; frames for it go to `sink`.
    Attach { conn: ConnKey, sink: FrameSink },

    /// A command frame arrived on `conn`.
    Frame { conn: ConnKey, frame: CommandFrame },

    /// `conn` closed or failed. Releases everything it owned.
    Detach { conn: ConnKey },

    /// Snapshot of subscriptions, optionally limited to one channel.
    QueryState {
        channel: Option<String>,
        respond_to: oneshot::Sender<Vec<StateRecord>>,
    },

    /// Current counters.
    Stats {
        respond_to: oneshot::Sender<BrokerStats>,
    },
}

/// Broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Attached connections
    pub connections: usize,

    /// Peers that sent `connect` and have not closed
    pub peers: usize,

    /// Channels with at least one subscriber
    pub channels: usize,

    /// Requests waiting for a response
    pub pending_requests: usize,
}

// ============================================================================
// Broker Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The actor stopped before answering.
    #[error("broker channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        assert_eq!(BrokerError::ChannelClosed.to_string(), "broker channel closed");
    }

    #[tokio::test]
    async fn test_dropped_responder_is_observable() {
        let (tx, rx) = oneshot::channel::<BrokerStats>();
        drop(tx);
        assert!(rx.await.is_err());
    }
}
