//! Handler for one accepted connection.
//!
//! Each connection runs two tasks:
//! - the reader (this handler) reassembles packets, parses the command
//!   header and hands frames to the broker in arrival order
//! - the writer owns the write half and drains the connection's frame queue
//!
//! A protocol error ends the connection; nothing else is affected.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in a detach

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ipcbus_protocol::{CodecError, CommandFrame, StreamDecoder};

use crate::registry::{BrokerError, BrokerHandle, ConnKey};

/// Bytes reserved for each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Connection handler for a single peer connection.
pub struct ConnectionHandler<S> {
    stream: S,
    conn: ConnKey,
    broker: BrokerHandle,
    max_packet_size: usize,
    write_timeout: Duration,
    cancel_token: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        conn: ConnKey,
        broker: BrokerHandle,
        max_packet_size: usize,
        write_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            stream,
            conn,
            broker,
            max_packet_size,
            write_timeout,
            cancel_token,
        }
    }

    /// Serves the connection until it closes, fails, or shutdown is requested.
    ///
    /// Always detaches from the broker before returning.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let conn = self.conn;
        debug!(conn, "New connection");

        let (reader, writer) = tokio::io::split(self.stream);
        let (sink, queue) = mpsc::unbounded_channel();
        self.broker.attach(conn, sink).await?;

        let mut writer_task = tokio::spawn(write_loop(writer, queue, self.write_timeout, conn));

        let (outcome, writer_done) = tokio::select! {
            result = read_loop(reader, conn, &self.broker, self.max_packet_size) => (result, false),
            result = &mut writer_task => {
                let result = result.unwrap_or_else(|e| Err(ConnectionError::Io(e.to_string())));
                (result, true)
            }
            _ = self.cancel_token.cancelled() => (Ok(()), false),
        };

        // Detach drops the broker's copies of the sink, which lets the writer
        // flush what is queued and finish.
        if let Err(e) = self.broker.detach(conn).await {
            debug!(conn, error = %e, "Detach after broker shutdown");
        }
        if !writer_done && timeout(self.write_timeout, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        match &outcome {
            Ok(()) => info!(conn, "Connection closed"),
            Err(e) => warn!(conn, error = %e, "Connection closed with error"),
        }
        outcome
    }
}

async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    conn: ConnKey,
    broker: &BrokerHandle,
    max_packet_size: usize,
) -> Result<(), ConnectionError>
where
    R: AsyncRead,
{
    let mut decoder = StreamDecoder::with_max_packet_size(max_packet_size);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        let n = reader
            .read_buf(&mut buf)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        if n == 0 {
            if decoder.has_partial() {
                return Err(ConnectionError::Codec(CodecError::Truncated));
            }
            return Ok(());
        }

        decoder.push(buf.split().freeze());
        while let Some(packet) = decoder.next_packet()? {
            let frame = CommandFrame::parse(packet)?;
            broker.frame(conn, frame).await?;
        }
    }
}

async fn write_loop<W>(
    writer: WriteHalf<W>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    write_timeout: Duration,
    conn: ConnKey,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite,
{
    let mut writer = BufWriter::new(writer);

    while let Some(frame) = queue.recv().await {
        write_frame(&mut writer, &frame, write_timeout).await?;
        // Flush once the queue is momentarily empty, not after every frame.
        while let Ok(frame) = queue.try_recv() {
            write_frame(&mut writer, &frame, write_timeout).await?;
        }
        match timeout(write_timeout, writer.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
            Err(_) => return Err(ConnectionError::WriteTimeout),
        }
    }

    debug!(conn, "Writer finished");
    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_frame<W>(
    writer: &mut BufWriter<WriteHalf<W>>,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite,
{
    match timeout(write_timeout, writer.write_all(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::spawn_broker;
    use ipcbus_core::{PeerDescriptor, PeerId, ProcessDescriptor};
    use ipcbus_protocol::{Command, CommandKind};

    fn handler(
        stream: tokio::io::DuplexStream,
        broker: BrokerHandle,
        conn: ConnKey,
    ) -> ConnectionHandler<tokio::io::DuplexStream> {
        ConnectionHandler::new(
            stream,
            conn,
            broker,
            1024,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Codec(CodecError::PacketTooLarge {
            size: 2_000_000,
            max: 1024,
        });
        assert!(err.to_string().contains("2000000"));
        assert_eq!(ConnectionError::WriteTimeout.to_string(), "Write timeout");
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let broker = spawn_broker();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handler(server, broker.clone(), 1).run());

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Codec(CodecError::MissingSeparator { found: b'G' }))
        ));
        assert_eq!(broker.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn test_oversized_packet_closes_connection() {
        let broker = spawn_broker();
        let (mut client, server) = tokio::io::duplex(8192);
        let task = tokio::spawn(handler(server, broker, 1).run());

        let sender = PeerDescriptor::new(PeerId::new("p"), "p", ProcessDescriptor::default());
        let big = Command::new(CommandKind::SendMessage, "x", sender)
            .with_args(vec![ipcbus_core::Value::from("y".repeat(4096))]);
        client.write_all(&big.encode().unwrap()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Codec(CodecError::PacketTooLarge { max: 1024, .. }))
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_detaches() {
        let broker = spawn_broker();
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(handler(server, broker.clone(), 5).run());
        drop(client);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(broker.stats().await.unwrap().connections, 0);
    }
}
