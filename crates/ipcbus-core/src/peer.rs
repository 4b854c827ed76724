//! Peer identity: who is on the other end of a bus connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of one bus peer.
///
/// Generated locally by the peer on connect and carried in the sender
/// descriptor of every command it issues. The broker keys its peer directory
/// and subscription entries by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a PeerId from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random peer id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of process a peer lives in.
///
/// Desktop applications typically run one privileged host process, several
/// sandboxed UI (renderer) processes and a number of helper workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Privileged main/host process
    Host,

    /// Sandboxed UI process
    Renderer,

    /// Background helper spawned by the application
    Worker,

    /// Standalone node-style process with no UI
    #[default]
    Node,

    /// Anything else, with a free-form label
    Other(String),
}

impl ProcessKind {
    /// Returns a short identifier for display.
    pub fn short_name(&self) -> &str {
        match self {
            Self::Host => "host",
            Self::Renderer => "renderer",
            Self::Worker => "worker",
            Self::Node => "node",
            Self::Other(name) => name.as_str(),
        }
    }

    /// Parses a process kind from a command-line style string.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "host" | "main" => Self::Host,
            "renderer" | "ui" => Self::Renderer,
            "worker" => Self::Worker,
            "node" => Self::Node,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Process a peer runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub kind: ProcessKind,
    pub pid: u32,
}

impl ProcessDescriptor {
    /// Describes the current process.
    pub fn current(kind: ProcessKind) -> Self {
        Self {
            kind,
            pid: std::process::id(),
        }
    }
}

/// Sender descriptor attached to every command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Unique peer id
    pub id: PeerId,

    /// Human readable peer name
    pub name: String,

    /// Process the peer lives in
    pub process: ProcessDescriptor,
}

impl PeerDescriptor {
    pub fn new(id: PeerId, name: impl Into<String>, process: ProcessDescriptor) -> Self {
        Self {
            id,
            name: name.into(),
            process,
        }
    }

    /// Creates a descriptor with a freshly generated id for the current process.
    pub fn generate(name: impl Into<String>, kind: ProcessKind) -> Self {
        Self::new(PeerId::generate(), name, ProcessDescriptor::current(kind))
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] ({} pid {})",
            self.name,
            self.id.short(),
            self.process.kind,
            self.process.pid
        )
    }
}
