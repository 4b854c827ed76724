//! Self-describing binary packets.
//!
//! ```text
//! fixed size:     '[' tag payload ']'
//! variable size:  '[' tag u32le(total size) payload ']'
//! ```
//!
//! | tag | type            | payload                     | total size   |
//! |-----|-----------------|-----------------------------|--------------|
//! | `+` | positive int    | u32le magnitude             | 7            |
//! | `-` | negative int    | u32le magnitude             | 7            |
//! | `d` | double          | f64le                       | 11           |
//! | `b` | boolean         | u8                          | 4            |
//! | `s` | string          | UTF-8                       | 7 + len      |
//! | `B` | buffer          | raw bytes                   | 7 + len      |
//! | `O` | object          | JSON text                   | 7 + len      |
//! | `A` | array           | child packets, back to back | 7 + children |
//!
//! Arrays do not store their element count: it falls out of walking the
//! children until the declared size is consumed. Every child carries its own
//! size, so element `i` is reachable by skipping `i` children undecoded.
//!
//! Nesting is bounded by [`MAX_NESTING_DEPTH`] so a hostile frame cannot
//! exhaust the decoding thread's stack.

use bytes::{BufMut, Bytes, BytesMut};

use ipcbus_core::Value;

use crate::error::{CodecError, CodecResult};

/// Leading separator byte.
pub const OPEN: u8 = b'[';

/// Trailing separator byte.
pub const CLOSE: u8 = b']';

/// Bytes needed to learn the total size of any packet.
pub const MIN_HEADER_LEN: usize = 6;

/// Separator + tag + size field + separator.
const VARIABLE_OVERHEAD: usize = MIN_HEADER_LEN + 1;

/// Default upper bound on a single packet (64 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Deepest array nesting accepted by the decoder, same as serde_json's
/// recursion limit.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketTag {
    PositiveInteger = b'+',
    NegativeInteger = b'-',
    Double = b'd',
    Boolean = b'b',
    String = b's',
    Buffer = b'B',
    Object = b'O',
    Array = b'A',
}

impl PacketTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'+' => Some(Self::PositiveInteger),
            b'-' => Some(Self::NegativeInteger),
            b'd' => Some(Self::Double),
            b'b' => Some(Self::Boolean),
            b's' => Some(Self::String),
            b'B' => Some(Self::Buffer),
            b'O' => Some(Self::Object),
            b'A' => Some(Self::Array),
            _ => None,
        }
    }

    /// Total packet size for fixed-size tags, `None` for variable-size ones.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Boolean => Some(4),
            Self::PositiveInteger | Self::NegativeInteger => Some(7),
            Self::Double => Some(11),
            Self::String | Self::Buffer | Self::Object | Self::Array => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PositiveInteger => "positive integer",
            Self::NegativeInteger => "negative integer",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Buffer => "buffer",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Reads the total packet size from the first bytes of a packet.
///
/// `header` holds whatever has arrived so far, at most [`MIN_HEADER_LEN`]
/// bytes are looked at. Returns `Ok(None)` while the header is plausible but
/// incomplete.
pub fn packet_size(header: &[u8]) -> CodecResult<Option<usize>> {
    let Some(&first) = header.first() else {
        return Ok(None);
    };
    if first != OPEN {
        return Err(CodecError::MissingSeparator { found: first });
    }
    let Some(&tag_byte) = header.get(1) else {
        return Ok(None);
    };
    let tag = PacketTag::from_byte(tag_byte).ok_or(CodecError::UnknownTag { tag: tag_byte })?;
    if let Some(size) = tag.fixed_size() {
        return Ok(Some(size));
    }
    if header.len() < MIN_HEADER_LEN {
        return Ok(None);
    }
    let size = read_u32(header, 2)? as usize;
    if size < VARIABLE_OVERHEAD {
        return Err(CodecError::InvalidSize { size });
    }
    Ok(Some(size))
}

/// Returns the tag of a packet whose first two bytes are available.
pub fn packet_tag(packet: &[u8]) -> CodecResult<PacketTag> {
    match (packet.first(), packet.get(1)) {
        (Some(&OPEN), Some(&tag)) => PacketTag::from_byte(tag).ok_or(CodecError::UnknownTag { tag }),
        (Some(&found), Some(_)) => Err(CodecError::MissingSeparator { found }),
        _ => Err(CodecError::Truncated),
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a value into a standalone packet.
pub fn encode(value: &Value) -> CodecResult<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Appends the packet for `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) -> CodecResult<()> {
    match value {
        Value::Boolean(b) => {
            buf.reserve(4);
            buf.put_u8(OPEN);
            buf.put_u8(PacketTag::Boolean as u8);
            buf.put_u8(u8::from(*b));
            buf.put_u8(CLOSE);
        }
        Value::Integer(n) => encode_integer(*n, buf),
        Value::Double(d) => encode_double(*d, buf),
        Value::String(s) => encode_variable(PacketTag::String, s.as_bytes(), buf)?,
        Value::Buffer(b) => encode_variable(PacketTag::Buffer, b, buf)?,
        Value::Object(o) => encode_variable(PacketTag::Object, o.to_string().as_bytes(), buf)?,
        Value::Array(items) => encode_array_into(items, buf)?,
    }
    Ok(())
}

/// Appends an array packet built from `items` without collecting them into
/// a [`Value::Array`] first.
pub fn encode_array_into(items: &[Value], buf: &mut BytesMut) -> CodecResult<()> {
    let start = begin_variable(PacketTag::Array, buf);
    for item in items {
        encode_into(item, buf)?;
    }
    finish_variable(start, buf)
}

/// Appends an Object packet holding the JSON form of `value`.
pub fn encode_json_into<T: serde::Serialize>(value: &T, buf: &mut BytesMut) -> CodecResult<()> {
    let json = serde_json::to_vec(value).map_err(CodecError::json)?;
    encode_variable(PacketTag::Object, &json, buf)
}

/// Integers whose magnitude fits in 32 bits use the integer tags, chosen by
/// sign (zero is positive); everything else falls back to a double.
fn encode_integer(n: i64, buf: &mut BytesMut) {
    match u32::try_from(n.unsigned_abs()) {
        Ok(magnitude) => {
            let tag = if n < 0 {
                PacketTag::NegativeInteger
            } else {
                PacketTag::PositiveInteger
            };
            buf.reserve(7);
            buf.put_u8(OPEN);
            buf.put_u8(tag as u8);
            buf.put_u32_le(magnitude);
            buf.put_u8(CLOSE);
        }
        Err(_) => encode_double(n as f64, buf),
    }
}

fn encode_double(d: f64, buf: &mut BytesMut) {
    buf.reserve(11);
    buf.put_u8(OPEN);
    buf.put_u8(PacketTag::Double as u8);
    buf.put_f64_le(d);
    buf.put_u8(CLOSE);
}

pub(crate) fn encode_variable(tag: PacketTag, payload: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
    buf.reserve(VARIABLE_OVERHEAD + payload.len());
    let start = begin_variable(tag, buf);
    buf.extend_from_slice(payload);
    finish_variable(start, buf)
}

/// Writes the header with a placeholder size; returns the packet start.
pub(crate) fn begin_variable(tag: PacketTag, buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_u8(OPEN);
    buf.put_u8(tag as u8);
    buf.put_u32_le(0);
    start
}

/// Writes the trailer and patches the size field.
pub(crate) fn finish_variable(start: usize, buf: &mut BytesMut) -> CodecResult<()> {
    buf.put_u8(CLOSE);
    let size = buf.len() - start;
    let declared = u32::try_from(size).map_err(|_| CodecError::PacketTooLarge {
        size,
        max: u32::MAX as usize,
    })?;
    if let Some(slot) = buf.get_mut(start + 2..start + MIN_HEADER_LEN) {
        slot.copy_from_slice(&declared.to_le_bytes());
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one complete packet.
///
/// `packet` must hold exactly one packet. Buffer payloads are returned as
/// slices of `packet` without copying.
pub fn decode(packet: &Bytes) -> CodecResult<Value> {
    let (value, end) = decode_at(packet, 0)?;
    if end != packet.len() {
        return Err(CodecError::InvalidSize { size: packet.len() });
    }
    Ok(value)
}

/// Decodes the packet starting at `offset`; returns the value and the offset
/// just past it.
pub fn decode_at(buf: &Bytes, offset: usize) -> CodecResult<(Value, usize)> {
    decode_nested(buf, offset, 0)
}

fn decode_nested(buf: &Bytes, offset: usize, depth: usize) -> CodecResult<(Value, usize)> {
    let (tag, end) = locate(buf, offset)?;
    let payload_start = offset + 2;
    let value = match tag {
        PacketTag::Boolean => {
            let byte = buf.get(payload_start).ok_or(CodecError::Truncated)?;
            Value::Boolean(*byte != 0)
        }
        PacketTag::PositiveInteger => Value::Integer(i64::from(read_u32(buf, payload_start)?)),
        PacketTag::NegativeInteger => Value::Integer(-i64::from(read_u32(buf, payload_start)?)),
        PacketTag::Double => Value::Double(read_f64(buf, payload_start)?),
        PacketTag::String => {
            let payload = variable_payload(buf, offset, end)?;
            let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
            Value::String(text.to_string())
        }
        PacketTag::Buffer => Value::Buffer(buf.slice(offset + MIN_HEADER_LEN..end - 1)),
        PacketTag::Object => {
            let payload = variable_payload(buf, offset, end)?;
            Value::Object(serde_json::from_slice(payload).map_err(CodecError::json)?)
        }
        PacketTag::Array => {
            check_depth(depth)?;
            let mut items = Vec::new();
            let mut pos = offset + MIN_HEADER_LEN;
            let children_end = end - 1;
            while pos < children_end {
                let (item, next) = decode_nested(buf, pos, depth + 1)?;
                if next > children_end {
                    return Err(CodecError::InvalidSize { size: next - offset });
                }
                items.push(item);
                pos = next;
            }
            Value::Array(items)
        }
    };
    Ok((value, end))
}

/// Checks that the packet at `offset` would decode, without building a
/// [`Value`]. Returns the offset just past it.
///
/// The broker runs this over arguments it forwards unread, so a payload
/// that no peer could decode is caught on the connection that sent it.
pub fn validate_at(buf: &[u8], offset: usize) -> CodecResult<usize> {
    validate_nested(buf, offset, 0)
}

fn validate_nested(buf: &[u8], offset: usize, depth: usize) -> CodecResult<usize> {
    let (tag, end) = locate(buf, offset)?;
    match tag {
        PacketTag::String => {
            std::str::from_utf8(variable_payload(buf, offset, end)?)
                .map_err(|_| CodecError::InvalidUtf8)?;
        }
        PacketTag::Object => {
            serde_json::from_slice::<serde::de::IgnoredAny>(variable_payload(buf, offset, end)?)
                .map_err(CodecError::json)?;
        }
        PacketTag::Array => {
            check_depth(depth)?;
            let children_end = end - 1;
            let mut pos = offset + MIN_HEADER_LEN;
            while pos < children_end {
                let next = validate_nested(buf, pos, depth + 1)?;
                if next > children_end {
                    return Err(CodecError::InvalidSize { size: next - offset });
                }
                pos = next;
            }
        }
        PacketTag::Boolean
        | PacketTag::PositiveInteger
        | PacketTag::NegativeInteger
        | PacketTag::Double
        | PacketTag::Buffer => {}
    }
    Ok(end)
}

fn check_depth(depth: usize) -> CodecResult<()> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(CodecError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }
    Ok(())
}

/// Finds the packet at `offset`: validates header, bounds and trailer.
/// Returns the tag and the offset just past the packet.
pub fn locate(buf: &[u8], offset: usize) -> CodecResult<(PacketTag, usize)> {
    let rest = buf.get(offset..).ok_or(CodecError::Truncated)?;
    let header = rest.get(..MIN_HEADER_LEN.min(rest.len())).unwrap_or(rest);
    let size = packet_size(header)?.ok_or(CodecError::Truncated)?;
    let tag = packet_tag(rest)?;
    if rest.len() < size {
        return Err(CodecError::Truncated);
    }
    if rest.get(size - 1) != Some(&CLOSE) {
        return Err(CodecError::MissingTrailer);
    }
    Ok((tag, offset + size))
}

/// Returns the undecoded bytes of element `index` of an array packet,
/// skipping earlier elements without decoding them.
pub fn array_element_bytes(packet: &Bytes, index: usize) -> CodecResult<Option<Bytes>> {
    let (tag, end) = locate(packet, 0)?;
    if tag != PacketTag::Array {
        return Err(CodecError::UnexpectedType {
            expected: "array",
            found: tag.name().to_string(),
        });
    }
    let children_end = end - 1;
    let mut pos = MIN_HEADER_LEN;
    let mut current = 0;
    while pos < children_end {
        let (_, next) = locate(packet, pos)?;
        if next > children_end {
            return Err(CodecError::InvalidSize { size: next });
        }
        if current == index {
            return Ok(Some(packet.slice(pos..next)));
        }
        current += 1;
        pos = next;
    }
    Ok(None)
}

/// Decodes element `index` of an array packet.
pub fn array_element(packet: &Bytes, index: usize) -> CodecResult<Option<Value>> {
    match array_element_bytes(packet, index)? {
        Some(child) => decode(&child).map(Some),
        None => Ok(None),
    }
}

/// Counts the elements of an array packet without decoding them.
pub fn array_len(packet: &[u8]) -> CodecResult<usize> {
    let (tag, end) = locate(packet, 0)?;
    if tag != PacketTag::Array {
        return Err(CodecError::UnexpectedType {
            expected: "array",
            found: tag.name().to_string(),
        });
    }
    let children_end = end - 1;
    let mut pos = MIN_HEADER_LEN;
    let mut count = 0;
    while pos < children_end {
        let (_, next) = locate(packet, pos)?;
        if next > children_end {
            return Err(CodecError::InvalidSize { size: next });
        }
        count += 1;
        pos = next;
    }
    Ok(count)
}

fn variable_payload(buf: &[u8], offset: usize, end: usize) -> CodecResult<&[u8]> {
    buf.get(offset + MIN_HEADER_LEN..end - 1)
        .ok_or(CodecError::Truncated)
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> CodecResult<u32> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::Truncated)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_f64(buf: &[u8], at: usize) -> CodecResult<f64> {
    let bytes: [u8; 8] = buf
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::Truncated)?;
    Ok(f64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: Value) {
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value, "round trip of {value:?}");
    }

    #[test]
    fn test_round_trip_scalars() {
        round_trip(Value::Boolean(true));
        round_trip(Value::Boolean(false));
        round_trip(Value::Integer(0));
        round_trip(Value::Integer(42));
        round_trip(Value::Integer(-42));
        round_trip(Value::Integer(i64::from(u32::MAX)));
        round_trip(Value::Integer(-i64::from(u32::MAX)));
        round_trip(Value::Double(3.25));
        round_trip(Value::Double(-1e300));
        round_trip(Value::from("héllo wörld"));
        round_trip(Value::from(""));
        round_trip(Value::Buffer(Bytes::from_static(&[0, 1, 2, 0xff])));
        round_trip(Value::Object(json!({"a": [1, 2, {"b": null}], "c": "d"})));
    }

    #[test]
    fn test_round_trip_nested_array() {
        round_trip(Value::Array(vec![
            Value::from(1),
            Value::from("two"),
            Value::Array(vec![Value::from(true), Value::Array(vec![])]),
            Value::Object(json!({"k": 1})),
            Value::Buffer(Bytes::from_static(b"raw")),
            Value::Double(0.5),
        ]));
    }

    #[test]
    fn test_large_integers_travel_as_double() {
        let big = Value::Integer(1 << 40);
        let encoded = encode(&big).unwrap();
        assert_eq!(encoded.get(1), Some(&(PacketTag::Double as u8)));
        let decoded = decode(&encoded).unwrap();
        assert!(matches!(decoded, Value::Double(_)));
        assert_eq!(decoded, big);

        let small_negative = Value::Integer(-(1 << 33));
        assert_eq!(decode(&encode(&small_negative).unwrap()).unwrap(), small_negative);
    }

    #[test]
    fn test_integer_tag_follows_sign() {
        let zero = encode(&Value::Integer(0)).unwrap();
        assert_eq!(zero.get(1), Some(&b'+'));
        let neg = encode(&Value::Integer(-1)).unwrap();
        assert_eq!(neg.get(1), Some(&b'-'));
        assert_eq!(neg.len(), 7);
    }

    #[test]
    fn test_declared_size_matches_length() {
        for value in [
            Value::from("abc"),
            Value::Buffer(Bytes::from_static(b"12345")),
            Value::Object(json!({"x": 1})),
            Value::Array(vec![Value::from(1), Value::from("z")]),
        ] {
            let encoded = encode(&value).unwrap();
            let declared = read_u32(&encoded, 2).unwrap() as usize;
            assert_eq!(declared, encoded.len());
            assert_eq!(encoded.first(), Some(&OPEN));
            assert_eq!(encoded.last(), Some(&CLOSE));
        }
    }

    #[test]
    fn test_packet_size_partial_and_errors() {
        assert_eq!(packet_size(&[]).unwrap(), None);
        assert_eq!(packet_size(b"[").unwrap(), None);
        assert_eq!(packet_size(b"[b").unwrap(), Some(4));
        assert_eq!(packet_size(b"[d").unwrap(), Some(11));
        assert_eq!(packet_size(b"[s\x10\x00").unwrap(), None);
        assert_eq!(packet_size(b"[s\x10\x00\x00\x00").unwrap(), Some(16));
        assert_eq!(
            packet_size(b"x").unwrap_err(),
            CodecError::MissingSeparator { found: b'x' }
        );
        assert_eq!(
            packet_size(b"[z").unwrap_err(),
            CodecError::UnknownTag { tag: b'z' }
        );
        assert_eq!(
            packet_size(b"[s\x03\x00\x00\x00").unwrap_err(),
            CodecError::InvalidSize { size: 3 }
        );
    }

    #[test]
    fn test_missing_trailer_rejected() {
        let mut bytes = BytesMut::from(&encode(&Value::from("abc")).unwrap()[..]);
        if let Some(last) = bytes.last_mut() {
            *last = b'x';
        }
        assert_eq!(decode(&bytes.freeze()).unwrap_err(), CodecError::MissingTrailer);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        encode_variable(PacketTag::String, &[0xff, 0xfe], &mut buf).unwrap();
        assert_eq!(decode(&buf.freeze()).unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn test_array_random_access() {
        let value = Value::Array(vec![
            Value::from("first"),
            Value::Object(json!({"big": "x".repeat(100)})),
            Value::from(7),
        ]);
        let encoded = encode(&value).unwrap();
        assert_eq!(array_len(&encoded).unwrap(), 3);
        assert_eq!(array_element(&encoded, 2).unwrap(), Some(Value::from(7)));
        assert_eq!(
            array_element(&encoded, 0).unwrap(),
            Some(Value::from("first"))
        );
        assert_eq!(array_element(&encoded, 3).unwrap(), None);

        let scalar = encode(&Value::from(1)).unwrap();
        assert!(array_element(&scalar, 0).is_err());
    }

    /// `depth` empty arrays nested inside each other.
    fn nested_arrays(depth: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(depth * VARIABLE_OVERHEAD);
        for level in 0..depth {
            buf.put_u8(OPEN);
            buf.put_u8(PacketTag::Array as u8);
            buf.put_u32_le(((depth - level) * VARIABLE_OVERHEAD) as u32);
        }
        buf.put_bytes(CLOSE, depth);
        buf.freeze()
    }

    #[test]
    fn test_nesting_limit() {
        let allowed = nested_arrays(MAX_NESTING_DEPTH);
        assert!(decode(&allowed).is_ok());
        assert_eq!(validate_at(&allowed, 0).unwrap(), allowed.len());

        let too_deep = nested_arrays(MAX_NESTING_DEPTH + 1);
        let expected = CodecError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        };
        assert_eq!(decode(&too_deep).unwrap_err(), expected);
        assert_eq!(validate_at(&too_deep, 0).unwrap_err(), expected);
    }

    #[test]
    fn test_pathological_nesting_fails_without_recursing_to_the_end() {
        let hostile = nested_arrays(300_000);
        assert!(matches!(decode(&hostile), Err(CodecError::NestingTooDeep { .. })));
        assert!(matches!(
            validate_at(&hostile, 0),
            Err(CodecError::NestingTooDeep { .. })
        ));
        // Walking the outer level only never descends.
        assert_eq!(array_len(&hostile).unwrap(), 1);
    }

    #[test]
    fn test_validate_catches_bad_children() {
        let good = encode(&Value::Array(vec![
            Value::from("ok"),
            Value::Object(json!({"k": [1, 2]})),
            Value::Buffer(Bytes::from_static(&[0xff])),
        ]))
        .unwrap();
        assert_eq!(validate_at(&good, 0).unwrap(), good.len());

        let mut bad_utf8 = BytesMut::new();
        let start = begin_variable(PacketTag::Array, &mut bad_utf8);
        encode_variable(PacketTag::String, &[0xff, 0xfe], &mut bad_utf8).unwrap();
        finish_variable(start, &mut bad_utf8).unwrap();
        assert_eq!(validate_at(&bad_utf8, 0).unwrap_err(), CodecError::InvalidUtf8);

        let mut bad_json = BytesMut::new();
        let start = begin_variable(PacketTag::Array, &mut bad_json);
        encode_variable(PacketTag::Object, b"{not json", &mut bad_json).unwrap();
        finish_variable(start, &mut bad_json).unwrap();
        assert!(matches!(
            validate_at(&bad_json, 0),
            Err(CodecError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_buffer_decode_is_zero_copy() {
        let encoded = encode(&Value::Buffer(Bytes::from_static(b"payload"))).unwrap();
        let decoded = decode(&encoded).unwrap();
        let buffer = decoded.as_bytes().unwrap();
        let inner = encoded.as_ptr() as usize + MIN_HEADER_LEN;
        assert_eq!(buffer.as_ptr() as usize, inner);
    }
}
