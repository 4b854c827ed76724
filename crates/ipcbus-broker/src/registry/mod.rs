//! Broker core using the Actor pattern.
//!
//! The broker is the single owner of routing state. Connection tasks feed it
//! commands over a bounded mpsc channel and receive outgoing frames through
//! per-connection unbounded queues.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  BrokerCommand   ┌─────────────────┐   Bytes    ┌─────────────────┐
//! │ reader task (n) │─────────────────▶│   BrokerActor   │───────────▶│ writer task (n) │
//! └─────────────────┘  (mpsc, bounded) └─────────────────┘ (mpsc)     └─────────────────┘
//!                                        │
//!                                        ├─ ChannelRegistry  channel → conn → peer → count
//!                                        ├─ pending          reply channel → conn
//!                                        └─ peers            peer id → (conn, descriptor)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

mod actor;
mod channels;
mod commands;
mod handle;

pub use actor::{BrokerActor, BROKER_PEER_ID};
pub use channels::{ChannelRegistry, ConnKey};
pub use commands::{BrokerCommand, BrokerError, BrokerStats, FrameSink};
pub use handle::BrokerHandle;

/// Command queue depth between connection tasks and the actor.
const COMMAND_BUFFER: usize = 1024;

/// Spawns the broker actor and returns a handle to it.
///
/// The actor stops once every handle clone is dropped.
///
/// # Example
///
/// ```no_run
/// use ipcbus_broker::registry::spawn_broker;
///
/// #[tokio::main]
/// async fn main() {
///     let broker = spawn_broker();
///     let records = broker.query_state(None).await;
/// }
/// ```
pub fn spawn_broker() -> BrokerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(BrokerActor::new(cmd_rx).run());
    BrokerHandle::new(cmd_tx)
}
