//! Bus commands and their wire framing.
//!
//! A command travels as one Array packet with five children:
//!
//! ```text
//! [A size
//!    [+ kind ]            offset 6, kind code at bytes 8..12
//!    [s size channel ]
//!    [O size sender-json ]
//!    [O size aux-json ]
//!    [A size args... ]
//! ]
//! ```
//!
//! [`CommandFrame`] decodes only the routing header (kind, channel, sender,
//! aux) and keeps the received bytes, so the broker can forward a frame or
//! re-tag it by patching the kind. The arguments are checked once on
//! arrival but never materialized on the broker.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use ipcbus_core::{PeerDescriptor, Value};

use crate::error::{CodecError, CodecResult};
use crate::packet::{self, PacketTag, MIN_HEADER_LEN};

/// Channel on which the broker broadcasts state snapshots requested without
/// a reply channel.
pub const BROKER_STATE_CHANNEL: &str = "/ipcbus/broker/state";

/// Byte offset of the kind code inside a command frame.
const KIND_OFFSET: usize = MIN_HEADER_LEN + 2;

/// What a command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    // Peer to broker
    Connect = 1,
    Close = 2,
    SubscribeChannel = 3,
    UnsubscribeChannel = 4,
    SendMessage = 5,
    RequestMessage = 6,
    /// Travels both ways: responder to broker, broker to requester.
    RequestResponse = 7,
    RequestCancel = 8,
    QueryState = 9,

    // Broker to peer
    /// A `SendMessage` re-tagged for delivery to subscribers.
    EventMessage = 10,
    /// A `RequestMessage` re-tagged for delivery to subscribers.
    EventRequest = 11,
}

impl CommandKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Connect),
            2 => Some(Self::Close),
            3 => Some(Self::SubscribeChannel),
            4 => Some(Self::UnsubscribeChannel),
            5 => Some(Self::SendMessage),
            6 => Some(Self::RequestMessage),
            7 => Some(Self::RequestResponse),
            8 => Some(Self::RequestCancel),
            9 => Some(Self::QueryState),
            10 => Some(Self::EventMessage),
            11 => Some(Self::EventRequest),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Close => "close",
            Self::SubscribeChannel => "subscribe-channel",
            Self::UnsubscribeChannel => "unsubscribe-channel",
            Self::SendMessage => "send-message",
            Self::RequestMessage => "request-message",
            Self::RequestResponse => "request-response",
            Self::RequestCancel => "request-cancel",
            Self::QueryState => "query-state",
            Self::EventMessage => "event-message",
            Self::EventRequest => "event-request",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Auxiliary data block carried by every command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxData {
    /// Generated channel the response to a request is correlated on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_channel: Option<String>,

    /// On a response: true resolves the request, false rejects it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve: Option<bool>,

    /// On an unsubscribe: drop every subscription of the connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe_all: Option<bool>,
}

impl AuxData {
    pub fn reply_to(channel: impl Into<String>) -> Self {
        Self {
            reply_channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn response(channel: impl Into<String>, resolve: bool) -> Self {
        Self {
            reply_channel: Some(channel.into()),
            resolve: Some(resolve),
            ..Self::default()
        }
    }

    pub fn is_unsubscribe_all(&self) -> bool {
        self.unsubscribe_all.unwrap_or(false)
    }

    /// Missing flag means resolve.
    pub fn is_resolve(&self) -> bool {
        self.resolve.unwrap_or(true)
    }
}

/// A fully decoded command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub channel: String,
    pub sender: PeerDescriptor,
    pub aux: AuxData,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(kind: CommandKind, channel: impl Into<String>, sender: PeerDescriptor) -> Self {
        Self {
            kind,
            channel: channel.into(),
            sender,
            aux: AuxData::default(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_aux(mut self, aux: AuxData) -> Self {
        self.aux = aux;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Encodes the command into one frame.
    pub fn encode(&self) -> CodecResult<Bytes> {
        let mut buf = BytesMut::new();
        let start = packet::begin_variable(PacketTag::Array, &mut buf);
        packet::encode_into(&Value::Integer(i64::from(self.kind.code())), &mut buf)?;
        packet::encode_variable(PacketTag::String, self.channel.as_bytes(), &mut buf)?;
        packet::encode_json_into(&self.sender, &mut buf)?;
        packet::encode_json_into(&self.aux, &mut buf)?;
        packet::encode_array_into(&self.args, &mut buf)?;
        packet::finish_variable(start, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a complete frame, arguments included.
    pub fn decode(frame: Bytes) -> CodecResult<Self> {
        CommandFrame::parse(frame)?.into_command()
    }
}

/// A received frame with its routing header decoded and its arguments left
/// as bytes.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    kind: CommandKind,
    channel: String,
    sender: PeerDescriptor,
    aux: AuxData,
    args_offset: usize,
    bytes: Bytes,
}

impl CommandFrame {
    /// Parses the header children and checks that the arguments decode.
    pub fn parse(bytes: Bytes) -> CodecResult<Self> {
        let frame = Self::parse_header(bytes)?;
        packet::validate_at(&frame.bytes, frame.args_offset)?;
        Ok(frame)
    }

    /// Parses the header children only. Argument errors surface later, from
    /// [`CommandFrame::args`].
    pub fn parse_header(bytes: Bytes) -> CodecResult<Self> {
        let (tag, end) = packet::locate(&bytes, 0)?;
        if tag != PacketTag::Array {
            return Err(CodecError::UnexpectedType {
                expected: "command array",
                found: tag.name().to_string(),
            });
        }
        if end != bytes.len() {
            return Err(CodecError::InvalidSize { size: bytes.len() });
        }

        let (kind_tag, pos) = packet::locate(&bytes, MIN_HEADER_LEN)?;
        if kind_tag != PacketTag::PositiveInteger {
            return Err(CodecError::UnexpectedType {
                expected: "integer kind",
                found: kind_tag.name().to_string(),
            });
        }
        let code = packet::read_u32(&bytes, KIND_OFFSET)?;
        let kind = CommandKind::from_code(code).ok_or(CodecError::UnknownCommand(code))?;

        let (channel, pos) = packet::decode_at(&bytes, pos)?;
        let channel = match channel {
            Value::String(s) => s,
            other => {
                return Err(CodecError::UnexpectedType {
                    expected: "string channel",
                    found: other.kind_name().to_string(),
                })
            }
        };

        let (sender, pos) = packet::decode_at(&bytes, pos)?;
        let sender: PeerDescriptor = from_object(sender, "object sender")?;

        let (aux, args_offset) = packet::decode_at(&bytes, pos)?;
        let aux: AuxData = from_object(aux, "object aux")?;

        let (args_tag, args_end) = packet::locate(&bytes, args_offset)?;
        if args_tag != PacketTag::Array {
            return Err(CodecError::UnexpectedType {
                expected: "argument array",
                found: args_tag.name().to_string(),
            });
        }
        if args_end != end - 1 {
            return Err(CodecError::MalformedCommand(
                "trailing data after arguments".to_string(),
            ));
        }

        Ok(Self {
            kind,
            channel,
            sender,
            aux,
            args_offset,
            bytes,
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn sender(&self) -> &PeerDescriptor {
        &self.sender
    }

    pub fn aux(&self) -> &AuxData {
        &self.aux
    }

    /// The frame exactly as received.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns a copy of the frame with its kind replaced.
    pub fn with_kind(&self, kind: CommandKind) -> Bytes {
        let mut buf = BytesMut::from(&self.bytes[..]);
        if let Some(slot) = buf.get_mut(KIND_OFFSET..KIND_OFFSET + 4) {
            slot.copy_from_slice(&kind.code().to_le_bytes());
        }
        buf.freeze()
    }

    /// Decodes the argument list.
    pub fn args(&self) -> CodecResult<Vec<Value>> {
        match packet::decode_at(&self.bytes, self.args_offset)?.0 {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::UnexpectedType {
                expected: "argument array",
                found: other.kind_name().to_string(),
            }),
        }
    }

    pub fn into_command(self) -> CodecResult<Command> {
        let args = self.args()?;
        Ok(Command {
            kind: self.kind,
            channel: self.channel,
            sender: self.sender,
            aux: self.aux,
            args,
        })
    }
}

fn from_object<T: serde::de::DeserializeOwned>(
    value: Value,
    expected: &'static str,
) -> CodecResult<T> {
    match value {
        Value::Object(json) => serde_json::from_value(json).map_err(CodecError::json),
        other => Err(CodecError::UnexpectedType {
            expected,
            found: other.kind_name().to_string(),
        }),
    }
}
