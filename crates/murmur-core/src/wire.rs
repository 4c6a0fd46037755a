//! Murmur wire format: the packet envelope carried by every transport message.
//!
//! One transport message carries exactly one encoded [`Packet`]. There is no
//! length prefix and no batching: the transport's own message framing is the
//! only delimiter.
//!
//! The encoding is protobuf-compatible so the collector can be swapped for any
//! protobuf consumer of the same schema:
//!
//! ```text
//! message AudioPacket {
//!   uint64 sequence_id = 1;   // varint
//!   bytes  audio_data  = 2;   // length-delimited
//!   int64  timestamp   = 3;   // varint, two's complement, epoch millis
//! }
//! ```
//!
//! The encoder always writes all three fields. The decoder requires fields 1
//! and 3, treats an absent field 2 as an empty payload, and skips unknown
//! fields so newer producers can add fields without breaking older collectors.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Per-session packet ordering key. Starts at 1, strictly increasing.
pub type SequenceId = u64;

// ── Field numbers and wire types ─────────────────────────────────────────────

const FIELD_SEQUENCE_ID: u64 = 1;
const FIELD_AUDIO_DATA: u64 = 2;
const FIELD_TIMESTAMP: u64 = 3;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_GROUP_START: u8 = 3;
const WIRE_GROUP_END: u8 = 4;
const WIRE_FIXED32: u8 = 5;

/// A varint never needs more than 10 bytes for a u64.
const MAX_VARINT_LEN: usize = 10;

/// Largest field number protobuf allows (2^29 - 1).
const MAX_FIELD_NUMBER: u64 = (1 << 29) - 1;

// ── Packet ───────────────────────────────────────────────────────────────────

/// The minimal unit of transmission: payload bytes plus ordering and timing.
///
/// Created once per chunk by the uplink manager and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: SequenceId,
    pub payload: Bytes,
    /// Capture time, milliseconds since the Unix epoch.
    pub captured_at_millis: i64,
}

impl Packet {
    pub fn new(sequence_id: SequenceId, payload: Bytes, captured_at_millis: i64) -> Self {
        Self {
            sequence_id,
            payload,
            captured_at_millis,
        }
    }

    /// Number of bytes [`encode`] will produce for this packet.
    pub fn encoded_len(&self) -> usize {
        let payload_len = self.payload.len();
        1 + varint_len(self.sequence_id)
            + 1
            + varint_len(payload_len as u64)
            + payload_len
            + 1
            + varint_len(self.captured_at_millis as u64)
    }
}

/// Current wall-clock time in epoch milliseconds. Clamps to 0 before 1970.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Reasons a transport message is rejected as a malformed packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("truncated packet")]
    Truncated,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("payload length {declared} exceeds remaining {remaining} bytes")]
    PayloadOverrun { declared: u64, remaining: usize },
    #[error("required field `{0}` missing")]
    MissingField(&'static str),
    #[error("field {field} has wire type {wire_type}")]
    WrongWireType { field: u64, wire_type: u8 },
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
    #[error("invalid field number {0}")]
    InvalidFieldNumber(u64),
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Serialize a packet. Pure and deterministic.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());

    put_key(&mut buf, FIELD_SEQUENCE_ID, WIRE_VARINT);
    put_varint(&mut buf, packet.sequence_id);

    put_key(&mut buf, FIELD_AUDIO_DATA, WIRE_LEN);
    put_varint(&mut buf, packet.payload.len() as u64);
    buf.put_slice(&packet.payload);

    put_key(&mut buf, FIELD_TIMESTAMP, WIRE_VARINT);
    put_varint(&mut buf, packet.captured_at_millis as u64);

    buf.freeze()
}

fn put_key(buf: &mut BytesMut, field: u64, wire_type: u8) {
    put_varint(buf, (field << 3) | u64::from(wire_type));
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn varint_len(value: u64) -> usize {
    // bits needed / 7, rounded up; zero still takes one byte
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Parse one transport message into a packet.
pub fn decode(frame: &[u8]) -> Result<Packet, MalformedPacket> {
    let mut buf = frame;
    let mut sequence_id = None;
    let mut payload = None;
    let mut timestamp = None;

    while buf.has_remaining() {
        let key = get_varint(&mut buf)?;
        let field = key >> 3;
        let wire_type = (key & 0x07) as u8;
        if field == 0 || field > MAX_FIELD_NUMBER {
            return Err(MalformedPacket::InvalidFieldNumber(field));
        }

        match (field, wire_type) {
            (FIELD_SEQUENCE_ID, WIRE_VARINT) => sequence_id = Some(get_varint(&mut buf)?),
            (FIELD_AUDIO_DATA, WIRE_LEN) => {
                let bytes = get_length_delimited(&mut buf)?;
                payload = Some(Bytes::copy_from_slice(bytes));
            }
            (FIELD_TIMESTAMP, WIRE_VARINT) => timestamp = Some(get_varint(&mut buf)? as i64),
            (FIELD_SEQUENCE_ID | FIELD_AUDIO_DATA | FIELD_TIMESTAMP, wire_type) => {
                return Err(MalformedPacket::WrongWireType { field, wire_type });
            }
            (_, wire_type) => skip_field(&mut buf, wire_type)?,
        }
    }

    Ok(Packet {
        sequence_id: sequence_id.ok_or(MalformedPacket::MissingField("sequence_id"))?,
        payload: payload.unwrap_or_default(),
        captured_at_millis: timestamp.ok_or(MalformedPacket::MissingField("timestamp"))?,
    })
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, MalformedPacket> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(MalformedPacket::Truncated);
        }
        let byte = buf.get_u8();
        // the tenth byte may only contribute the top bit
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(MalformedPacket::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(MalformedPacket::VarintOverflow)
}

fn get_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], MalformedPacket> {
    let declared = get_varint(buf)?;
    let remaining = buf.remaining();
    if declared > remaining as u64 {
        return Err(MalformedPacket::PayloadOverrun {
            declared,
            remaining,
        });
    }
    let (bytes, rest) = buf.split_at(declared as usize);
    *buf = rest;
    Ok(bytes)
}

fn skip_field(buf: &mut &[u8], wire_type: u8) -> Result<(), MalformedPacket> {
    let width = match wire_type {
        WIRE_VARINT => {
            get_varint(buf)?;
            return Ok(());
        }
        WIRE_LEN => {
            get_length_delimited(buf)?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_FIXED32 => 4,
        WIRE_GROUP_START | WIRE_GROUP_END => {
            return Err(MalformedPacket::UnsupportedWireType(wire_type))
        }
        other => return Err(MalformedPacket::UnsupportedWireType(other)),
    };
    if buf.remaining() < width {
        return Err(MalformedPacket::Truncated);
    }
    buf.advance(width);
    Ok(())
}
