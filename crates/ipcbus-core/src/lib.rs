//! ipcbus Core - Shared types for the message bus
//!
//! This crate provides the domain types shared between
//! the broker (`ipcbus-broker`), the wire protocol and peers.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod address;
pub mod error;
pub mod peer;
pub mod state;
pub mod value;

// Re-exports for convenience
pub use address::{Address, DEFAULT_HOST, DEFAULT_PORT};
pub use error::{DomainError, DomainResult};
pub use peer::{PeerDescriptor, PeerId, ProcessDescriptor, ProcessKind};
pub use state::StateRecord;
pub use value::Value;
