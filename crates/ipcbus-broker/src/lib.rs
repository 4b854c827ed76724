//! ipcbus broker - channel registry and routing server
//!
//! This crate provides the broker side of the bus:
//! - `registry` - the broker actor: channel subscriptions, pending requests,
//!   peer directory
//! - `server` - TCP / Unix socket server and per-connection tasks
//! - `config` - broker configuration (TOML file, environment)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ipcbusd broker                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  BrokerServer   │────▶│        BrokerActor          │    │
//! │  │ (TCP / Unix)    │     │  (routing state owner)      │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ frames            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│◀────│  per-connection frame queue │    │
//! │  │ (reader+writer) │     │  (mpsc::UnboundedSender)    │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod registry;
pub mod server;

pub use config::{BrokerConfig, ConfigError};
pub use registry::{spawn_broker, BrokerHandle, BrokerStats};
pub use server::{BrokerListener, BrokerServer, ServerError};
