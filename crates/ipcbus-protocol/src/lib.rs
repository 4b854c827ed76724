//! ipcbus protocol - the wire format shared by broker and peers
//!
//! - [`packet`]: self-describing binary packets for [`ipcbus_core::Value`]
//! - [`decoder`]: reassembly of packets from an arbitrarily chunked stream
//! - [`command`]: bus commands framed as packets, with cheap re-tagging

pub mod command;
pub mod decoder;
pub mod error;
pub mod packet;

pub use command::{AuxData, Command, CommandFrame, CommandKind, BROKER_STATE_CHANNEL};
pub use decoder::{decode_stream, StreamDecoder};
pub use error::{CodecError, CodecResult};
pub use packet::{
    array_element, array_len, decode, encode, encode_into, validate_at, PacketTag,
    DEFAULT_MAX_PACKET_SIZE, MAX_NESTING_DEPTH, MIN_HEADER_LEN,
};
