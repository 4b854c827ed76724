//! Error types for the peer transport.
//!
//! Callers only see these from the suspending operations (`connect`,
//! `request`, `query_state`) and from local misuse. Routing failures never
//! produce an error of their own: a request nobody answers times out.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use std::time::Duration;

use thiserror::Error;

use ipcbus_core::{DomainError, Value};
use ipcbus_protocol::CodecError;

// ============================================================================
// Peer Error Type
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    /// A call was made before `connect` completed or after `close`.
    ///
    /// Nothing was sent.
    #[error("Not connected to broker")]
    NotConnected,

    /// The broker could not be reached before the connect timeout.
    #[error("Failed to connect to broker at {address} within {timeout:?}: {reason}")]
    ConnectTimeout {
        address: String,
        timeout: Duration,
        reason: String,
    },

    /// No response arrived before the request timeout.
    ///
    /// A `request-cancel` has been sent on a best-effort basis.
    #[error("Request on '{channel}' timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    /// The responder rejected the request; the payload is its reply.
    #[error("Request rejected")]
    Rejected(Vec<Value>),

    /// The connection closed while the call was waiting.
    #[error("Connection to broker closed")]
    Closed,

    /// The broker sent something undecodable.
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] DomainError),
}

impl PeerError {
    /// True for errors that mean the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed | Self::Io(_))
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, PeerError>;
