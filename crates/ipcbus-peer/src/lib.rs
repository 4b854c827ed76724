//! ipcbus peer - client transport for the bus
//!
//! A process joins the bus through a [`Peer`]:
//! - `peer` - connection lifecycle, publish/subscribe, request/response
//! - `supervisor` - reaches the broker with exponential backoff
//! - `listeners` - local callback table, one wire subscription per channel
//! - `event` - events handed to listeners, reply handles for requests
//! - `config` - broker address, identity, retry and timeout settings
//!
//! # Architecture
//!
//! The peer runs two tasks per connection, both owned by the connection's
//! `CancellationToken`:
//!
//! 1. **Reader Task**: decodes frames from the socket and dispatches events
//!    and responses
//! 2. **Writer Task**: drains the outbound frame queue into the socket
//!
//! API calls never block on the socket; they encode a frame and queue it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//!   outside tests
//! - A dropped connection resolves every pending request with
//!   [`PeerError::Closed`]

pub mod config;
pub mod error;
pub mod event;
pub mod listeners;
pub mod peer;
pub mod supervisor;

pub use config::{PeerConfig, RetryPolicy};
pub use error::{PeerError, Result};
pub use event::{BusEvent, ReplyHandle};
pub use listeners::{Listener, ListenerId};
pub use peer::Peer;
pub use supervisor::{BusStream, Supervisor};
