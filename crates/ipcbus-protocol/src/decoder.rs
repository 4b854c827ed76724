//! Incremental packet reassembly.
//!
//! Bytes arrive from a socket in arbitrary chunks. [`StreamDecoder`] keeps
//! the chunks queued as received and hands out one complete packet at a time,
//! regardless of how the stream was split.
//!
//! ```text
//!   push(chunk) ──► [ chunk | chunk | chunk ] ──► next_packet() ──► Bytes
//!                     ▲ header peeked across chunk boundaries
//! ```
//!
//! A packet that lies within a single chunk is split off without copying.
//! One that straddles chunks is gathered into a fresh buffer exactly once.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use ipcbus_core::Value;

use crate::error::{CodecError, CodecResult};
use crate::packet::{self, CLOSE, DEFAULT_MAX_PACKET_SIZE, MIN_HEADER_LEN};

/// Reassembles packets from a byte stream.
#[derive(Debug)]
pub struct StreamDecoder {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    max_packet_size: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates a decoder that rejects packets declaring more than `max` bytes.
    pub fn with_max_packet_size(max: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            max_packet_size: max,
        }
    }

    /// Queues a chunk of received bytes.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Bytes queued but not yet returned as packets.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// True if part of a packet is waiting for more bytes.
    pub fn has_partial(&self) -> bool {
        self.buffered > 0
    }

    /// Returns the next complete packet, or `None` if more bytes are needed.
    ///
    /// An error means the stream is corrupt; the decoder should be dropped
    /// together with the connection that fed it.
    pub fn next_packet(&mut self) -> CodecResult<Option<Bytes>> {
        let mut header = [0u8; MIN_HEADER_LEN];
        let available = self.peek(&mut header);
        let Some(size) = packet::packet_size(&header[..available])? else {
            return Ok(None);
        };
        if size > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }
        if self.buffered < size {
            return Ok(None);
        }

        let packet = self.take(size);
        if packet.last() != Some(&CLOSE) {
            return Err(CodecError::MissingTrailer);
        }
        Ok(Some(packet))
    }

    /// Returns the next complete packet decoded into a value.
    pub fn next_value(&mut self) -> CodecResult<Option<Value>> {
        match self.next_packet()? {
            Some(packet) => packet::decode(&packet).map(Some),
            None => Ok(None),
        }
    }

    /// Copies up to `out.len()` leading bytes without consuming them.
    fn peek(&self, out: &mut [u8]) -> usize {
        let mut filled = 0;
        for chunk in &self.chunks {
            let Some(dest) = out.get_mut(filled..) else {
                break;
            };
            let n = dest.len().min(chunk.len());
            if let (Some(dest), Some(src)) = (dest.get_mut(..n), chunk.get(..n)) {
                dest.copy_from_slice(src);
            }
            filled += n;
            if filled == out.len() {
                break;
            }
        }
        filled
    }

    /// Removes exactly `size` bytes from the front. Caller checks `buffered`.
    fn take(&mut self, size: usize) -> Bytes {
        self.buffered -= size;

        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= size {
                let packet = front.split_to(size);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                return packet;
            }
        }

        let mut gathered = BytesMut::with_capacity(size);
        while gathered.len() < size {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let want = size - gathered.len();
            if front.len() <= want {
                gathered.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                gathered.extend_from_slice(&front[..want]);
                front.advance(want);
            }
        }
        gathered.freeze()
    }
}

/// Decodes every packet contained in `chunks`, in order.
///
/// Trailing bytes that do not form a whole packet are an error.
pub fn decode_stream<I>(chunks: I) -> CodecResult<Vec<Value>>
where
    I: IntoIterator<Item = Bytes>,
{
    let mut decoder = StreamDecoder::new();
    let mut values = Vec::new();
    for chunk in chunks {
        decoder.push(chunk);
        while let Some(value) = decoder.next_value()? {
            values.push(value);
        }
    }
    if decoder.has_partial() {
        return Err(CodecError::Truncated);
    }
    Ok(values)
}
