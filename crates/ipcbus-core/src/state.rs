//! Broker state snapshot records.

use serde::{Deserialize, Serialize};

use crate::peer::PeerDescriptor;

/// One line of a `query-state` answer: a peer subscribed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Channel name
    pub channel: String,

    /// Subscribed peer
    pub peer: PeerDescriptor,

    /// Number of outstanding subscribe calls for this peer on this channel
    pub count: u32,
}

impl StateRecord {
    pub fn new(channel: impl Into<String>, peer: PeerDescriptor, count: u32) -> Self {
        Self {
            channel: channel.into(),
            peer,
            count,
        }
    }
}
