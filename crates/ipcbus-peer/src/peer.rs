//! Peer transport: the per-process client of the bus.
//!
//! A [`Peer`] turns API calls into command frames, demultiplexes incoming
//! frames to local listeners and correlates request responses.
//!
//! # Architecture
//!
//! ```text
//!   send / subscribe / request                       listeners
//!             │                                          ▲
//!             ▼                                          │ dispatch (sync)
//!   ┌──────────────────┐  Bytes   ┌──────────┐   ┌──────────────┐
//!   │       Peer       │────────▶ │  writer  │   │    reader    │
//!   │ listeners/pending│  (mpsc)  │   task   │   │     task     │
//!   └──────────────────┘          └────┬─────┘   └──────▲───────┘
//!             ▲                        │                │
//!             │ resolve/reject         ▼     broker     │
//!             └──────────────────── socket ─────────────┘
//! ```
//!
//! Lifecycle: `connect` → `Connected` → `close` (or the broker goes away) →
//! disconnected. While disconnected every call fails with
//! [`PeerError::NotConnected`] without touching the wire. Listeners survive
//! a lost connection and are re-announced on the next `connect`.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`. Poisoned locks are recovered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ipcbus_core::{PeerDescriptor, PeerId, StateRecord, Value};
use ipcbus_protocol::{AuxData, Command, CommandFrame, CommandKind, StreamDecoder};

use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use crate::event::{BusEvent, ReplyHandle};
use crate::listeners::{Listener, ListenerId, ListenerTable};
use crate::supervisor::{BusStream, Supervisor};

/// Bytes reserved for each socket read.
const READ_CHUNK: usize = 16 * 1024;

type Resolver = oneshot::Sender<Result<Vec<Value>>>;

/// A live connection: where frames go and how to stop its tasks.
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel_token: CancellationToken,
}

struct Inner {
    config: PeerConfig,
    descriptor: PeerDescriptor,
    connection: Mutex<Option<Connection>>,
    listeners: Mutex<ListenerTable>,
    pending: Mutex<HashMap<String, Resolver>>,
    generations: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(connection) = lock(&self.connection).take() {
            connection.cancel_token.cancel();
        }
    }
}

/// Client handle for one bus peer.
///
/// Cheap to clone; all clones share one identity and one connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use ipcbus_core::Value;
/// use ipcbus_peer::{Peer, PeerConfig};
///
/// # async fn demo() -> ipcbus_peer::Result<()> {
/// let peer = Peer::new(PeerConfig::from_env()?.with_name("editor"));
/// peer.connect(Duration::from_secs(2)).await?;
///
/// peer.subscribe("files/changed", Arc::new(|event: &ipcbus_peer::BusEvent| {
///     println!("{} changed", event.args.len());
/// }))?;
/// peer.send("files/changed", vec![Value::from("a.txt")])?;
///
/// let sum = peer
///     .request("math/add", vec![Value::from(1), Value::from(2)], Duration::from_millis(500))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// Creates a disconnected peer with a freshly generated id.
    pub fn new(config: PeerConfig) -> Self {
        let descriptor = PeerDescriptor::generate(config.name.clone(), config.process_kind.clone());
        Self::with_descriptor(config, descriptor)
    }

    /// Creates a disconnected peer with a caller-chosen identity.
    pub fn with_descriptor(config: PeerConfig, descriptor: PeerDescriptor) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                descriptor,
                connection: Mutex::new(None),
                listeners: Mutex::new(ListenerTable::default()),
                pending: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.descriptor.id
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.inner.descriptor
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection).is_some()
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    /// Connects to the configured broker, retrying until `timeout`.
    ///
    /// Resolves once the stream is open and `connect` has been queued. Does
    /// nothing if already connected.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let supervisor = Supervisor::new(self.inner.config.address.clone(), self.inner.config.retry.clone());
        let stream: Box<dyn BusStream> = supervisor.connect(timeout).await?;
        self.connect_stream(stream)
    }

    /// Runs the peer over an already-open stream.
    ///
    /// Replaces any existing connection.
    pub fn connect_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        tokio::spawn(write_loop(writer, queue, cancel_token.clone()));
        tokio::spawn(read_loop(
            reader,
            Arc::downgrade(&self.inner),
            outbound.clone(),
            generation,
            cancel_token.clone(),
        ));

        let previous = lock(&self.inner.connection).replace(Connection {
            generation,
            outbound,
            cancel_token,
        });
        if let Some(previous) = previous {
            previous.cancel_token.cancel();
        }

        self.command(Command::new(CommandKind::Connect, "", self.inner.descriptor.clone()))?;
        // Channels with listeners from before a lost connection.
        for channel in lock(&self.inner.listeners).channels() {
            self.command(Command::new(
                CommandKind::SubscribeChannel,
                channel,
                self.inner.descriptor.clone(),
            ))?;
        }

        info!(peer = %self.inner.descriptor, "Connected to broker");
        Ok(())
    }

    /// Sends `close`, stops the connection tasks, rejects every pending
    /// request with [`PeerError::Closed`] and drops all listeners.
    pub fn close(&self) -> Result<()> {
        let Some(connection) = lock(&self.inner.connection).take() else {
            return Err(PeerError::NotConnected);
        };

        let close = Command::new(CommandKind::Close, "", self.inner.descriptor.clone()).encode()?;
        let _ = connection.outbound.send(close);
        connection.cancel_token.cancel();

        lock(&self.inner.listeners).clear();
        fail_pending(&self.inner);
        info!(peer_id = %self.id(), "Closed connection to broker");
        Ok(())
    }

    // ========================================================================
    // Publish / Subscribe
    // ========================================================================

    /// Publishes `args` on `channel`. Fire-and-forget.
    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        self.command(
            Command::new(CommandKind::SendMessage, channel, self.inner.descriptor.clone())
                .with_args(args),
        )
    }

    /// Registers `listener` for `channel`.
    ///
    /// Only the channel's first local listener produces a wire subscription.
    pub fn subscribe(&self, channel: &str, listener: Listener) -> Result<ListenerId> {
        self.outbound()?;
        let (id, first) = lock(&self.inner.listeners).add(channel, listener);
        if first {
            self.command(Command::new(
                CommandKind::SubscribeChannel,
                channel,
                self.inner.descriptor.clone(),
            ))?;
        }
        debug!(channel = %channel, listener = %id, first, "Subscribed");
        Ok(id)
    }

    /// Subscribes and returns the events as a stream instead of a callback.
    pub fn subscribe_events(
        &self,
        channel: &str,
    ) -> Result<(ListenerId, mpsc::UnboundedReceiver<BusEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |event: &BusEvent| {
            let _ = tx.send(event.clone());
        });
        let id = self.subscribe(channel, listener)?;
        Ok((id, rx))
    }

    /// Removes one listener. Returns false if it was not registered.
    ///
    /// Removing the channel's last local listener produces a wire
    /// unsubscription.
    pub fn unsubscribe(&self, channel: &str, id: ListenerId) -> Result<bool> {
        self.outbound()?;
        let removed = lock(&self.inner.listeners).remove(channel, id);
        match removed {
            Some(true) => {
                self.command(Command::new(
                    CommandKind::UnsubscribeChannel,
                    channel,
                    self.inner.descriptor.clone(),
                ))?;
                Ok(true)
            }
            Some(false) => Ok(true),
            None => Ok(false),
        }
    }

    /// Removes every local listener of `channel`. Returns how many there were.
    pub fn unsubscribe_all(&self, channel: &str) -> Result<usize> {
        self.outbound()?;
        let removed = lock(&self.inner.listeners).remove_all(channel);
        if removed > 0 {
            self.command(
                Command::new(CommandKind::UnsubscribeChannel, channel, self.inner.descriptor.clone())
                    .with_aux(AuxData {
                        unsubscribe_all: Some(true),
                        ..AuxData::default()
                    }),
            )?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Request / Response
    // ========================================================================

    /// Sends a request and waits for the single response.
    ///
    /// - resolved response: `Ok(args)`
    /// - rejected response: [`PeerError::Rejected`]
    /// - nothing before `timeout`: [`PeerError::Timeout`], after sending a
    ///   best-effort `request-cancel`
    pub async fn request(&self, channel: &str, args: Vec<Value>, timeout: Duration) -> Result<Vec<Value>> {
        let cmd = Command::new(CommandKind::RequestMessage, channel, self.inner.descriptor.clone())
            .with_args(args);
        self.call(cmd, timeout).await
    }

    /// Asks the broker for its subscription table, optionally for one channel
    /// (empty string: everything).
    pub async fn query_state(&self, channel: &str) -> Result<Vec<StateRecord>> {
        let cmd = Command::new(CommandKind::QueryState, channel, self.inner.descriptor.clone());
        let args = self.call(cmd, self.inner.config.query_timeout).await?;
        match args.into_iter().next() {
            Some(Value::Object(json)) => Ok(serde_json::from_value(json)?),
            Some(other) => Err(PeerError::Protocol(ipcbus_protocol::CodecError::UnexpectedType {
                expected: "state records",
                found: other.kind_name().to_string(),
            })),
            None => Ok(Vec::new()),
        }
    }

    async fn call(&self, mut cmd: Command, timeout: Duration) -> Result<Vec<Value>> {
        let outbound = self.outbound()?;
        let reply_channel = format!("/ipcbus/reply/{}", uuid::Uuid::new_v4().simple());
        cmd.aux = AuxData::reply_to(reply_channel.as_str());
        let frame = cmd.encode()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(reply_channel.clone(), tx);
        if outbound.send(frame).is_err() {
            lock(&self.inner.pending).remove(&reply_channel);
            return Err(PeerError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&reply_channel);
                let cancel = Command::new(CommandKind::RequestCancel, cmd.channel.as_str(), self.inner.descriptor.clone())
                    .with_aux(AuxData::reply_to(reply_channel.as_str()));
                if let Ok(frame) = cancel.encode() {
                    let _ = outbound.send(frame);
                }
                debug!(channel = %cmd.channel, reply_channel = %reply_channel, "Request timed out");
                Err(PeerError::Timeout {
                    channel: cmd.channel,
                    timeout,
                })
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Bytes>> {
        lock(&self.inner.connection)
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(PeerError::NotConnected)
    }

    fn command(&self, cmd: Command) -> Result<()> {
        let outbound = self.outbound()?;
        let frame = cmd.encode()?;
        outbound.send(frame).map_err(|_| PeerError::NotConnected)
    }
}

// ============================================================================
// I/O Tasks
// ============================================================================

async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    inner: Weak<Inner>,
    outbound: mpsc::UnboundedSender<Bytes>,
    generation: u64,
    cancel_token: CancellationToken,
) where
    R: AsyncRead,
{
    let max_packet_size = match inner.upgrade() {
        Some(inner) => inner.config.max_packet_size,
        None => return,
    };
    let mut decoder = StreamDecoder::with_max_packet_size(max_packet_size);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let outcome: Result<()> = loop {
        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = cancel_token.cancelled() => break Ok(()),
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break Err(PeerError::Closed),
            Ok(_) => {}
            Err(e) => break Err(PeerError::Io(e)),
        }

        decoder.push(buf.split().freeze());
        let step = loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => {
                    let Some(strong) = inner.upgrade() else {
                        break Some(Ok(()));
                    };
                    if let Err(e) = dispatch(&strong, &outbound, packet) {
                        break Some(Err(e));
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(Err(PeerError::Protocol(e))),
            }
        };
        if let Some(result) = step {
            break result;
        }
    };

    if let Some(inner) = inner.upgrade() {
        let lost = {
            let mut connection = lock(&inner.connection);
            let current = connection.as_ref().is_some_and(|c| c.generation == generation);
            if current {
                if let Some(c) = connection.take() {
                    c.cancel_token.cancel();
                }
            }
            current
        };
        if lost {
            fail_pending(&inner);
            match outcome {
                Err(e) => warn!(peer_id = %inner.descriptor.id, error = %e, "Lost connection to broker"),
                Ok(()) => debug!(peer_id = %inner.descriptor.id, "Reader stopped"),
            }
        }
    }
}

async fn write_loop<W>(
    writer: WriteHalf<W>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    cancel_token: CancellationToken,
) where
    W: AsyncWrite,
{
    let mut writer = BufWriter::new(writer);

    let result: std::io::Result<()> = async {
        loop {
            let frame = tokio::select! {
                frame = queue.recv() => frame,
                _ = cancel_token.cancelled() => None,
            };
            let Some(frame) = frame else {
                break;
            };
            writer.write_all(&frame).await?;
            while let Ok(frame) = queue.try_recv() {
                writer.write_all(&frame).await?;
            }
            writer.flush().await?;
        }
        // Whatever was queued before cancellation (e.g. `close`) still goes out.
        while let Ok(frame) = queue.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        writer.shutdown().await
    }
    .await;

    if let Err(e) = result {
        debug!(error = %e, "Writer stopped");
        cancel_token.cancel();
    }
}

/// Routes one incoming frame.
///
/// A bad routing header ends the connection. Arguments that fail to decode
/// only cost the one event or response they belong to.
fn dispatch(inner: &Inner, outbound: &mpsc::UnboundedSender<Bytes>, packet: Bytes) -> Result<()> {
    let frame = CommandFrame::parse_header(packet)?;
    match frame.kind() {
        CommandKind::EventMessage | CommandKind::EventRequest => {
            let reply = match (frame.kind(), frame.aux().reply_channel.as_ref()) {
                (CommandKind::EventRequest, Some(reply)) => Some(ReplyHandle::new(
                    reply.clone(),
                    inner.descriptor.clone(),
                    outbound.clone(),
                )),
                _ => None,
            };
            let listeners = lock(&inner.listeners).snapshot(frame.channel());
            if listeners.is_empty() {
                debug!(channel = %frame.channel(), "Event without local listeners");
                return Ok(());
            }
            let args = match frame.args() {
                Ok(args) => args,
                Err(e) => {
                    warn!(
                        channel = %frame.channel(),
                        sender = %frame.sender().id,
                        error = %e,
                        "Dropping event with undecodable arguments"
                    );
                    return Ok(());
                }
            };
            let event = BusEvent {
                channel: frame.channel().to_string(),
                sender: frame.sender().clone(),
                args,
                reply,
            };
            for listener in listeners {
                listener(&event);
            }
        }
        CommandKind::RequestResponse => {
            let reply = frame.aux().reply_channel.as_deref().unwrap_or_default();
            let resolver = lock(&inner.pending).remove(reply);
            match resolver {
                Some(resolver) => {
                    let result = match frame.args() {
                        Ok(args) if frame.aux().is_resolve() => Ok(args),
                        Ok(args) => Err(PeerError::Rejected(args)),
                        Err(e) => {
                            warn!(reply_channel = %reply, error = %e, "Response with undecodable arguments");
                            Err(PeerError::Protocol(e))
                        }
                    };
                    let _ = resolver.send(result);
                }
                None => debug!(reply_channel = %reply, "Late response dropped"),
            }
        }
        other => debug!(kind = %other, "Unexpected command from broker ignored"),
    }
    Ok(())
}

fn fail_pending(inner: &Inner) {
    let pending: Vec<Resolver> = lock(&inner.pending).drain().map(|(_, r)| r).collect();
    for resolver in pending {
        let _ = resolver.send(Err(PeerError::Closed));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbus_core::ProcessKind;
    use tokio::io::DuplexStream;

    /// Broker end of a duplex pipe, speaking raw command frames.
    struct FakeBroker {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        decoder: StreamDecoder,
    }

    impl FakeBroker {
        async fn next_frame(&mut self) -> CommandFrame {
            loop {
                if let Some(packet) = self.decoder.next_packet().unwrap() {
                    return CommandFrame::parse(packet).unwrap();
                }
                let mut buf = BytesMut::with_capacity(4096);
                let n = tokio::time::timeout(Duration::from_secs(2), self.reader.read_buf(&mut buf))
                    .await
                    .expect("broker read timed out")
                    .unwrap();
                assert!(n > 0, "peer closed the stream");
                self.decoder.push(buf.freeze());
            }
        }

        async fn send(&mut self, cmd: Command) {
            self.send_raw(&cmd.encode().unwrap()).await;
        }

        async fn send_raw(&mut self, frame: &[u8]) {
            self.writer.write_all(frame).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn broker_descriptor() -> PeerDescriptor {
        PeerDescriptor::generate("broker", ProcessKind::Host)
    }

    async fn connected_peer() -> (Peer, FakeBroker) {
        let peer = Peer::new(PeerConfig::default().with_name("test-peer"));
        let mut broker = attach(&peer);
        let connect = broker.next_frame().await;
        assert_eq!(connect.kind(), CommandKind::Connect);
        assert_eq!(connect.sender().id, *peer.id());
        (peer, broker)
    }

    /// Encodes `cmd` with its string argument `"QQ"` turned into invalid UTF-8.
    fn with_bad_utf8_arg(cmd: Command) -> Vec<u8> {
        let mut bytes = cmd.encode().unwrap().to_vec();
        let at = bytes.windows(2).rposition(|w| w == b"QQ").unwrap();
        bytes[at..at + 2].copy_from_slice(&[0xff, 0xfe]);
        bytes
    }

    fn attach(peer: &Peer) -> FakeBroker {
        let (client, server) = tokio::io::duplex(64 * 1024);
        peer.connect_stream(client).unwrap();
        let (reader, writer) = tokio::io::split(server);
        FakeBroker {
            reader,
            writer,
            decoder: StreamDecoder::new(),
        }
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail() {
        let peer = Peer::new(PeerConfig::default());
        assert!(!peer.is_connected());
        assert!(matches!(peer.send("x", vec![]), Err(PeerError::NotConnected)));
        assert!(matches!(
            peer.subscribe("x", Arc::new(|_: &BusEvent| {})),
            Err(PeerError::NotConnected)
        ));
        assert!(matches!(
            peer.request("x", vec![], Duration::from_millis(10)).await,
            Err(PeerError::NotConnected)
        ));
        assert!(matches!(peer.close(), Err(PeerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_carries_channel_and_args() {
        let (peer, mut broker) = connected_peer().await;
        peer.send("x", vec![Value::from("hello"), Value::from(7)]).unwrap();

        let frame = broker.next_frame().await;
        assert_eq!(frame.kind(), CommandKind::SendMessage);
        assert_eq!(frame.channel(), "x");
        assert_eq!(frame.args().unwrap(), vec![Value::from("hello"), Value::from(7)]);
    }

    #[tokio::test]
    async fn test_only_first_and_last_listener_reach_the_wire() {
        let (peer, mut broker) = connected_peer().await;
        let a = peer.subscribe("x", Arc::new(|_: &BusEvent| {})).unwrap();
        let b = peer.subscribe("x", Arc::new(|_: &BusEvent| {})).unwrap();
        assert!(peer.unsubscribe("x", a).unwrap());
        assert!(!peer.unsubscribe("x", a).unwrap());
        assert!(peer.unsubscribe("x", b).unwrap());
        peer.send("marker", vec![]).unwrap();

        let frame = broker.next_frame().await;
        assert_eq!(frame.kind(), CommandKind::SubscribeChannel);
        assert_eq!(frame.channel(), "x");
        let frame = broker.next_frame().await;
        assert_eq!(frame.kind(), CommandKind::UnsubscribeChannel);
        assert!(!frame.aux().is_unsubscribe_all());
        let frame = broker.next_frame().await;
        assert_eq!(frame.channel(), "marker");
    }

    #[tokio::test]
    async fn test_unsubscribe_all_sets_flag() {
        let (peer, mut broker) = connected_peer().await;
        peer.subscribe("x", Arc::new(|_: &BusEvent| {})).unwrap();
        peer.subscribe("x", Arc::new(|_: &BusEvent| {})).unwrap();
        assert_eq!(peer.unsubscribe_all("x").unwrap(), 2);
        assert_eq!(peer.unsubscribe_all("x").unwrap(), 0);

        assert_eq!(broker.next_frame().await.kind(), CommandKind::SubscribeChannel);
        let frame = broker.next_frame().await;
        assert_eq!(frame.kind(), CommandKind::UnsubscribeChannel);
        assert!(frame.aux().is_unsubscribe_all());
    }

    #[tokio::test]
    async fn test_events_reach_listeners() {
        let (peer, mut broker) = connected_peer().await;
        let (_, mut events) = peer.subscribe_events("x").unwrap();
        let (_, mut other) = peer.subscribe_events("x").unwrap();
        broker.next_frame().await;

        let origin = broker_descriptor();
        broker
            .send(Command::new(CommandKind::EventMessage, "x", origin.clone()).with_args(vec![Value::from(1)]))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.channel, "x");
        assert_eq!(event.sender, origin);
        assert_eq!(event.args, vec![Value::from(1)]);
        assert!(!event.is_request());
        assert!(other.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_event_is_dropped_and_connection_kept() {
        let (peer, mut broker) = connected_peer().await;
        let (_, mut events) = peer.subscribe_events("x").unwrap();
        broker.next_frame().await;

        let origin = broker_descriptor();
        let bad = Command::new(CommandKind::EventMessage, "x", origin.clone())
            .with_args(vec![Value::from("QQ")]);
        broker.send_raw(&with_bad_utf8_arg(bad)).await;
        broker
            .send(Command::new(CommandKind::EventMessage, "x", origin).with_args(vec![Value::from(2)]))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.args, vec![Value::from(2)]);
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_undecodable_response_fails_only_its_request() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.request("x", vec![], Duration::from_secs(1)).await });

        let reply = broker.next_frame().await.aux().reply_channel.clone().unwrap();
        let bad = Command::new(CommandKind::RequestResponse, reply.as_str(), broker_descriptor())
            .with_aux(AuxData::response(reply.as_str(), true))
            .with_args(vec![Value::from("QQ")]);
        broker.send_raw(&with_bad_utf8_arg(bad)).await;

        assert!(matches!(call.await.unwrap(), Err(PeerError::Protocol(_))));
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_request_resolves() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move {
            caller
                .request("math/add", vec![Value::from(1), Value::from(2)], Duration::from_secs(1))
                .await
        });

        let request = broker.next_frame().await;
        assert_eq!(request.kind(), CommandKind::RequestMessage);
        let reply = request.aux().reply_channel.clone().unwrap();
        assert!(reply.starts_with("/ipcbus/reply/"));
        broker
            .send(
                Command::new(CommandKind::RequestResponse, reply.as_str(), broker_descriptor())
                    .with_aux(AuxData::response(reply.as_str(), true))
                    .with_args(vec![Value::from(3)]),
            )
            .await;

        assert_eq!(call.await.unwrap().unwrap(), vec![Value::from(3)]);
    }

    #[tokio::test]
    async fn test_request_rejected() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.request("x", vec![], Duration::from_secs(1)).await });

        let reply = broker.next_frame().await.aux().reply_channel.clone().unwrap();
        broker
            .send(
                Command::new(CommandKind::RequestResponse, reply.as_str(), broker_descriptor())
                    .with_aux(AuxData::response(reply.as_str(), false))
                    .with_args(vec![Value::from("no")]),
            )
            .await;

        match call.await.unwrap() {
            Err(PeerError::Rejected(args)) => assert_eq!(args, vec![Value::from("no")]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_sends_cancel() {
        let (peer, mut broker) = connected_peer().await;
        let started = tokio::time::Instant::now();
        let result = peer.request("slow", vec![], Duration::from_millis(100)).await;

        assert!(matches!(result, Err(PeerError::Timeout { ref channel, .. }) if channel == "slow"));
        assert!(started.elapsed() >= Duration::from_millis(100));

        let request = broker.next_frame().await;
        let cancel = broker.next_frame().await;
        assert_eq!(cancel.kind(), CommandKind::RequestCancel);
        assert_eq!(cancel.aux().reply_channel, request.aux().reply_channel);
        assert!(lock(&peer.inner.pending).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_fires_on_schedule() {
        let (peer, mut broker) = connected_peer().await;
        let start = tokio::time::Instant::now();
        let result = peer.request("nobody", vec![], Duration::from_millis(500)).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(PeerError::Timeout { .. })));
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(510));
        assert_eq!(broker.next_frame().await.kind(), CommandKind::RequestMessage);
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let (peer, mut broker) = connected_peer().await;
        let _ = peer.request("slow", vec![], Duration::from_millis(20)).await;
        let reply = broker.next_frame().await.aux().reply_channel.clone().unwrap();
        broker
            .send(
                Command::new(CommandKind::RequestResponse, reply.as_str(), broker_descriptor())
                    .with_aux(AuxData::response(reply.as_str(), true)),
            )
            .await;

        peer.send("still-alive", vec![]).unwrap();
        broker.next_frame().await; // request-cancel
        assert_eq!(broker.next_frame().await.channel(), "still-alive");
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_incoming_request_can_be_answered() {
        let (peer, mut broker) = connected_peer().await;
        peer.subscribe(
            "math/double",
            Arc::new(|event: &BusEvent| {
                let n = event.args[0].as_i64().unwrap();
                event.reply.as_ref().unwrap().resolve(vec![Value::from(n * 2)]).unwrap();
            }),
        )
        .unwrap();
        broker.next_frame().await;

        broker
            .send(
                Command::new(CommandKind::EventRequest, "math/double", broker_descriptor())
                    .with_aux(AuxData::reply_to("/ipcbus/reply/abc"))
                    .with_args(vec![Value::from(21)]),
            )
            .await;

        let response = broker.next_frame().await;
        assert_eq!(response.kind(), CommandKind::RequestResponse);
        assert_eq!(response.aux().reply_channel.as_deref(), Some("/ipcbus/reply/abc"));
        assert!(response.aux().is_resolve());
        assert_eq!(response.sender().id, *peer.id());
        assert_eq!(response.args().unwrap(), vec![Value::from(42)]);
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.request("x", vec![], Duration::from_secs(5)).await });
        assert_eq!(broker.next_frame().await.kind(), CommandKind::RequestMessage);

        peer.close().unwrap();
        assert!(!peer.is_connected());
        assert!(matches!(call.await.unwrap(), Err(PeerError::Closed)));
        assert_eq!(broker.next_frame().await.kind(), CommandKind::Close);
        assert!(matches!(peer.send("x", vec![]), Err(PeerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_broker_disconnect_fails_pending_requests() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.request("x", vec![], Duration::from_secs(5)).await });
        broker.next_frame().await;
        drop(broker);

        assert!(matches!(call.await.unwrap(), Err(PeerError::Closed)));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_query_state_decodes_records() {
        let (peer, mut broker) = connected_peer().await;
        let caller = peer.clone();
        let call = tokio::spawn(async move { caller.query_state("x").await });

        let query = broker.next_frame().await;
        assert_eq!(query.kind(), CommandKind::QueryState);
        assert_eq!(query.channel(), "x");
        let reply = query.aux().reply_channel.clone().unwrap();
        let records = vec![StateRecord::new("x", peer.descriptor().clone(), 2)];
        broker
            .send(
                Command::new(CommandKind::RequestResponse, reply.as_str(), broker_descriptor())
                    .with_aux(AuxData::response(reply.as_str(), true))
                    .with_args(vec![Value::Object(serde_json::to_value(&records).unwrap())]),
            )
            .await;

        assert_eq!(call.await.unwrap().unwrap(), records);
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let (peer, mut first) = connected_peer().await;
        peer.subscribe("x", Arc::new(|_: &BusEvent| {})).unwrap();
        peer.subscribe("y", Arc::new(|_: &BusEvent| {})).unwrap();
        first.next_frame().await;
        first.next_frame().await;

        let mut second = attach(&peer);
        assert_eq!(second.next_frame().await.kind(), CommandKind::Connect);
        let mut channels = vec![
            second.next_frame().await.channel().to_string(),
            second.next_frame().await.channel().to_string(),
        ];
        channels.sort();
        assert_eq!(channels, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_timeout_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PeerConfig::default().with_address(ipcbus_core::Address::Local(dir.path().join("none.sock")));
        config.retry.initial_delay = Duration::from_millis(10);
        let peer = Peer::new(config);

        let result = peer.connect(Duration::from_millis(80)).await;
        assert!(matches!(result, Err(PeerError::ConnectTimeout { .. })));
        assert!(!peer.is_connected());
    }
}
