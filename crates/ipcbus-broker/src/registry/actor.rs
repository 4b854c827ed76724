//! Broker actor - owns all routing state and processes commands.
//!
//! The BrokerActor is the single owner of the channel registry, the
//! pending-request table and the peer directory. Connection tasks only
//! decode frames and hand them over; every mutation happens here, one
//! command at a time, so routing decisions never interleave.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Frame sinks that are gone are skipped; their connection's `Detach`
//!   follows and cleans up
//! - Commands that make no sense (unknown reply channel, unsubscribe of
//!   something never subscribed) are logged at debug and ignored

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ipcbus_core::{PeerDescriptor, PeerId, ProcessDescriptor, ProcessKind, StateRecord, Value};
use ipcbus_protocol::{AuxData, Command, CommandFrame, CommandKind, BROKER_STATE_CHANNEL};

use super::channels::{ChannelRegistry, ConnKey};
use super::commands::{BrokerCommand, BrokerStats, FrameSink};

/// Peer id the broker uses as sender of the frames it originates.
pub const BROKER_PEER_ID: &str = "ipcbus-broker";

// ============================================================================
// Broker Actor
// ============================================================================

/// The broker actor.
///
/// # Ownership
///
/// - `connections`: frame sink of every attached connection
/// - `registry`: channel subscriptions, holding clones of those sinks
/// - `pending`: reply channel → requesting connection
/// - `peers`: peer id → (connection, descriptor), filled by `connect`
pub struct BrokerActor {
    receiver: mpsc::Receiver<BrokerCommand>,
    connections: HashMap<ConnKey, FrameSink>,
    registry: ChannelRegistry<FrameSink>,
    pending: HashMap<String, ConnKey>,
    peers: HashMap<PeerId, (ConnKey, PeerDescriptor)>,
    descriptor: PeerDescriptor,
}

impl BrokerActor {
    pub fn new(receiver: mpsc::Receiver<BrokerCommand>) -> Self {
        Self {
            receiver,
            connections: HashMap::new(),
            registry: ChannelRegistry::new(),
            pending: HashMap::new(),
            peers: HashMap::new(),
            descriptor: PeerDescriptor::new(
                PeerId::new(BROKER_PEER_ID),
                BROKER_PEER_ID,
                ProcessDescriptor::current(ProcessKind::Node),
            ),
        }
    }

    /// Processes commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("Broker actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            connections = self.connections.len(),
            channels = self.registry.channel_count(),
            "Broker actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Attach { conn, sink } => {
                debug!(conn, "Connection attached");
                self.connections.insert(conn, sink);
            }
            BrokerCommand::Frame { conn, frame } => self.handle_frame(conn, frame),
            BrokerCommand::Detach { conn } => self.handle_detach(conn),
            BrokerCommand::QueryState {
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.snapshot(channel.as_deref()));
            }
            BrokerCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    // ========================================================================
    // Frame Handlers
    // ========================================================================

    fn handle_frame(&mut self, conn: ConnKey, frame: CommandFrame) {
        let Some(sink) = self.connections.get(&conn).cloned() else {
            debug!(conn, kind = %frame.kind(), "Frame from detached connection ignored");
            return;
        };

        let peer_id = &frame.sender().id;
        if frame.kind() != CommandKind::Connect && !self.peers.contains_key(peer_id) {
            debug!(conn, peer_id = %peer_id, kind = %frame.kind(), "Command from peer that never connected");
        }

        debug!(
            conn,
            kind = %frame.kind(),
            channel = %frame.channel(),
            peer_id = %peer_id,
            "Routing frame"
        );

        match frame.kind() {
            CommandKind::Connect => self.handle_connect(conn, &frame),
            CommandKind::Close => self.handle_close(conn, &frame),
            CommandKind::SubscribeChannel => {
                let count = self
                    .registry
                    .add_ref(frame.channel(), conn, &sink, frame.sender());
                debug!(conn, channel = %frame.channel(), count, "Subscribed");
            }
            CommandKind::UnsubscribeChannel => self.handle_unsubscribe(conn, &frame),
            CommandKind::SendMessage => {
                let event = frame.with_kind(CommandKind::EventMessage);
                let delivered = self.fan_out(frame.channel(), &event);
                debug!(channel = %frame.channel(), delivered, "Message fanned out");
            }
            CommandKind::RequestMessage => self.handle_request(conn, &frame),
            CommandKind::RequestResponse => self.handle_response(&frame),
            CommandKind::RequestCancel => {
                let reply = frame.aux().reply_channel.as_deref().unwrap_or_default();
                if self.pending.remove(reply).is_some() {
                    debug!(reply_channel = %reply, "Request cancelled");
                } else {
                    debug!(reply_channel = %reply, "Cancel for unknown request ignored");
                }
            }
            CommandKind::QueryState => self.handle_query_state(&sink, &frame),
            CommandKind::EventMessage | CommandKind::EventRequest => {
                debug!(conn, kind = %frame.kind(), "Broker-bound event ignored");
            }
        }
    }

    fn handle_connect(&mut self, conn: ConnKey, frame: &CommandFrame) {
        let descriptor = frame.sender().clone();
        info!(conn, peer = %descriptor, "Peer connected");
        if let Some((previous, _)) = self
            .peers
            .insert(descriptor.id.clone(), (conn, descriptor))
        {
            if previous != conn {
                debug!(conn, previous, "Peer id moved to a new connection");
            }
        }
    }

    fn handle_close(&mut self, conn: ConnKey, frame: &CommandFrame) {
        let peer_id = &frame.sender().id;
        let released = self.registry.release_peer(conn, peer_id);
        let known = self
            .peers
            .get(peer_id)
            .is_some_and(|(owner, _)| *owner == conn);
        if known {
            self.peers.remove(peer_id);
        }
        info!(conn, peer_id = %peer_id, released, "Peer closed");
    }

    fn handle_unsubscribe(&mut self, conn: ConnKey, frame: &CommandFrame) {
        let channel = frame.channel();
        if frame.aux().is_unsubscribe_all() {
            let removed = self.registry.release_all(channel, conn);
            debug!(conn, channel = %channel, removed, "Unsubscribed all");
            return;
        }
        match self.registry.release(channel, conn, &frame.sender().id) {
            Some(count) => debug!(conn, channel = %channel, count, "Unsubscribed"),
            None => debug!(conn, channel = %channel, "Unsubscribe without subscription ignored"),
        }
    }

    fn handle_request(&mut self, conn: ConnKey, frame: &CommandFrame) {
        let Some(reply) = frame.aux().reply_channel.clone() else {
            debug!(conn, channel = %frame.channel(), "Request without reply channel dropped");
            return;
        };
        if !self.registry.has_channel(frame.channel()) {
            // Nobody can answer; the requester's own timeout reports it.
            debug!(channel = %frame.channel(), reply_channel = %reply, "Request with no subscribers dropped");
            return;
        }

        match self.pending.get(&reply) {
            Some(&owner) if owner != conn => {
                // The first requester keeps its reply channel.
                debug!(
                    conn,
                    owner,
                    reply_channel = %reply,
                    "Request reusing another connection's reply channel dropped"
                );
                return;
            }
            _ => {
                self.pending.insert(reply.clone(), conn);
            }
        }
        let event = frame.with_kind(CommandKind::EventRequest);
        let delivered = self.fan_out(frame.channel(), &event);
        debug!(channel = %frame.channel(), reply_channel = %reply, delivered, "Request fanned out");
    }

    fn handle_response(&mut self, frame: &CommandFrame) {
        let reply = frame.aux().reply_channel.as_deref().unwrap_or_default();
        let Some(requester) = self.pending.remove(reply) else {
            debug!(reply_channel = %reply, "Response for unknown request dropped");
            return;
        };
        match self.connections.get(&requester) {
            Some(sink) => {
                if sink.send(frame.bytes().clone()).is_err() {
                    debug!(conn = requester, "Requester went away before response");
                }
            }
            None => debug!(conn = requester, "Requester detached before response"),
        }
    }

    fn handle_query_state(&self, sink: &FrameSink, frame: &CommandFrame) {
        let channel = Some(frame.channel()).filter(|c| !c.is_empty());
        let records = self.snapshot(channel);
        let payload = match serde_json::to_value(&records) {
            Ok(json) => Value::Object(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize broker state");
                return;
            }
        };

        match frame.aux().reply_channel.as_deref() {
            Some(reply) => {
                let response = Command::new(CommandKind::RequestResponse, reply, self.descriptor.clone())
                    .with_aux(AuxData::response(reply, true))
                    .with_args(vec![payload]);
                match response.encode() {
                    Ok(bytes) => {
                        let _ = sink.send(bytes);
                    }
                    Err(e) => warn!(error = %e, "Failed to encode state response"),
                }
            }
            None => {
                let event = Command::new(
                    CommandKind::EventMessage,
                    BROKER_STATE_CHANNEL,
                    self.descriptor.clone(),
                )
                .with_args(vec![payload]);
                match event.encode() {
                    Ok(bytes) => {
                        let delivered = self.fan_out(BROKER_STATE_CHANNEL, &bytes);
                        debug!(delivered, "Broker state broadcast");
                    }
                    Err(e) => warn!(error = %e, "Failed to encode state event"),
                }
            }
        }
    }

    fn handle_detach(&mut self, conn: ConnKey) {
        self.connections.remove(&conn);
        let channels = self.registry.release_connection(conn);
        let before = self.pending.len();
        self.pending.retain(|_, owner| *owner != conn);
        let dropped_requests = before - self.pending.len();
        self.peers.retain(|_, (owner, _)| *owner != conn);

        info!(
            conn,
            channels = channels.len(),
            dropped_requests,
            "Connection detached"
        );
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Writes `bytes` once to every connection subscribed to `channel`.
    fn fan_out(&self, channel: &str, bytes: &Bytes) -> usize {
        let mut delivered = 0;
        self.registry.for_each_channel(channel, |conn, sink| {
            if sink.send(bytes.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(conn, channel = %channel, "Subscriber sink closed");
            }
        });
        delivered
    }

    fn snapshot(&self, channel: Option<&str>) -> Vec<StateRecord> {
        match channel {
            Some(channel) => self.registry.dump_channel(channel),
            None => self.registry.dump(),
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.connections.len(),
            peers: self.peers.len(),
            channels: self.registry.channel_count(),
            pending_requests: self.pending.len(),
        }
    }
}
