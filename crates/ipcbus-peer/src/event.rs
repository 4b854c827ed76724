//! Events delivered to local listeners.

use bytes::Bytes;
use tokio::sync::mpsc;

use ipcbus_core::{PeerDescriptor, Value};
use ipcbus_protocol::{AuxData, Command, CommandKind};

use crate::error::{PeerError, Result};

/// A message or request received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub channel: String,

    /// Peer that published the message or issued the request.
    pub sender: PeerDescriptor,

    pub args: Vec<Value>,

    /// Present when the event is a request expecting a response.
    pub reply: Option<ReplyHandle>,
}

impl BusEvent {
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }
}

/// Answers one request. Only the first response to reach the broker is
/// delivered; later ones are dropped there.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    reply_channel: String,
    responder: PeerDescriptor,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl ReplyHandle {
    pub(crate) fn new(
        reply_channel: String,
        responder: PeerDescriptor,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            reply_channel,
            responder,
            outbound,
        }
    }

    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    /// Resolves the request with `args`.
    pub fn resolve(&self, args: Vec<Value>) -> Result<()> {
        self.respond(true, args)
    }

    /// Rejects the request with `args`.
    pub fn reject(&self, args: Vec<Value>) -> Result<()> {
        self.respond(false, args)
    }

    fn respond(&self, resolve: bool, args: Vec<Value>) -> Result<()> {
        let frame = Command::new(
            CommandKind::RequestResponse,
            self.reply_channel.as_str(),
            self.responder.clone(),
        )
        .with_aux(AuxData::response(self.reply_channel.as_str(), resolve))
        .with_args(args)
        .encode()?;
        self.outbound.send(frame).map_err(|_| PeerError::Closed)
    }
}
