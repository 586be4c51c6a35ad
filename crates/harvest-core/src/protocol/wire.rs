//! TLV part encoders and decoders
//!
//! Low-level codecs for the individual part kinds: NUL-terminated
//! identity strings, big-endian numbers, and typed value arrays. The
//! packet-level loop in [`super::packet`] drives these.
//!
//! All integers on the wire are big-endian. Gauges are the exception:
//! they travel as little-endian IEEE-754 doubles, the byte order of the
//! historical x86 senders, with one special NaN bit pattern.

use std::time::Duration;

use smallvec::SmallVec;

use crate::errors::{ProtocolError, Result};
use crate::types::{Value, ValueKind, MAX_IDENTITY_LEN};

use super::{PartType, PART_HEADER_SIZE};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Bytes per value in a VALUES part: one type code plus eight data bytes
const BYTES_PER_VALUE: usize = 9;

/// Largest value count a VALUES part can carry within its u16 length
pub const MAX_VALUES_PER_PART: usize =
    (u16::MAX as usize - PART_HEADER_SIZE - 2) / BYTES_PER_VALUE;

/// Wire encoding of NaN: the x86 byte pattern historical senders used
const NAN_WIRE: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf8, 0x7f];

// ----------------------------------------------------------------------------
// Buffer Cursor
// ----------------------------------------------------------------------------

/// One TLV part, borrowed from the packet buffer
pub(crate) struct Part<'a> {
    pub tag: u16,
    pub payload: &'a [u8],
    /// Everything after this part, to the end of the packet. Envelope
    /// parts cover this region.
    pub rest: &'a [u8],
}

/// Left-to-right, non-owning cursor over a packet buffer
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Consume and return the next part, or `None` at end of packet
    pub fn next_part(&mut self) -> Result<Option<Part<'a>>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() < PART_HEADER_SIZE {
            return Err(ProtocolError::malformed("truncated part header"));
        }

        let tag = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;

        // The length covers the header; anything smaller than a header
        // plus one payload byte cannot be a valid part.
        if length <= PART_HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "part 0x{tag:04x} claims impossible length {length}"
            )));
        }
        if length > self.buf.len() {
            return Err(ProtocolError::malformed(format!(
                "part 0x{tag:04x} of length {length} exceeds the {} bytes left",
                self.buf.len()
            )));
        }

        let payload = &self.buf[PART_HEADER_SIZE..length];
        let rest = &self.buf[length..];
        self.buf = rest;
        Ok(Some(Part { tag, payload, rest }))
    }
}

// ----------------------------------------------------------------------------
// Part Decoders
// ----------------------------------------------------------------------------

/// Decode a NUL-terminated identity string (64 bytes max including NUL)
pub(crate) fn parse_string_part(payload: &[u8]) -> Result<String> {
    if payload.len() > MAX_IDENTITY_LEN + 1 {
        return Err(ProtocolError::malformed(format!(
            "identity string of {} bytes exceeds the {}-byte limit",
            payload.len(),
            MAX_IDENTITY_LEN + 1
        )));
    }
    match payload.last() {
        Some(0) => {}
        _ => return Err(ProtocolError::malformed("string part is not NUL-terminated")),
    }

    let bytes = &payload[..payload.len() - 1];
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::malformed("string part is not valid UTF-8"))
}

/// Decode a big-endian u64 payload (TIME, INTERVAL and HR variants)
pub(crate) fn parse_number_part(payload: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| ProtocolError::malformed("number part is not 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decode a VALUES payload: u16 count, count type codes, count 8-byte
/// values
pub(crate) fn parse_values_part(payload: &[u8]) -> Result<SmallVec<[Value; 4]>> {
    if payload.len() < 2 {
        return Err(ProtocolError::malformed("values part shorter than its count"));
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;

    // Length and value count must agree exactly.
    if count * BYTES_PER_VALUE + 2 != payload.len() {
        return Err(ProtocolError::malformed(format!(
            "values part length {} does not match value count {count}",
            payload.len()
        )));
    }

    let codes = &payload[2..2 + count];
    let data = &payload[2 + count..];

    let mut values = SmallVec::with_capacity(count);
    for (i, &code) in codes.iter().enumerate() {
        let raw: [u8; 8] = data[i * 8..i * 8 + 8]
            .try_into()
            .map_err(|_| ProtocolError::malformed("value data truncated"))?;
        let value = match ValueKind::from_wire(code)? {
            ValueKind::Counter => Value::Counter(u64::from_be_bytes(raw)),
            ValueKind::Gauge => Value::Gauge(decode_gauge(raw)),
            ValueKind::Derive => Value::Derive(u64::from_be_bytes(raw)),
            ValueKind::Absolute => Value::Absolute(u64::from_be_bytes(raw)),
        };
        values.push(value);
    }
    Ok(values)
}

// ----------------------------------------------------------------------------
// Part Encoders
// ----------------------------------------------------------------------------

fn write_part_header(out: &mut Vec<u8>, tag: PartType, length: usize) {
    out.extend_from_slice(&(tag as u16).to_be_bytes());
    out.extend_from_slice(&(length as u16).to_be_bytes());
}

/// Append an identity string part, NUL terminator included
pub(crate) fn write_string_part(out: &mut Vec<u8>, tag: PartType, s: &str) -> Result<()> {
    if s.len() > MAX_IDENTITY_LEN {
        return Err(ProtocolError::malformed(format!(
            "identity string {s:?} exceeds {MAX_IDENTITY_LEN} bytes"
        )));
    }
    if s.as_bytes().contains(&0) {
        return Err(ProtocolError::malformed("identity string contains NUL"));
    }

    write_part_header(out, tag, PART_HEADER_SIZE + s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

/// Append a big-endian u64 part
pub(crate) fn write_number_part(out: &mut Vec<u8>, tag: PartType, value: u64) {
    write_part_header(out, tag, PART_HEADER_SIZE + 8);
    out.extend_from_slice(&value.to_be_bytes());
}

/// Append a VALUES part
pub(crate) fn write_values_part(out: &mut Vec<u8>, values: &[Value]) -> Result<()> {
    if values.len() > MAX_VALUES_PER_PART {
        return Err(ProtocolError::malformed(format!(
            "{} values exceed the per-part maximum of {MAX_VALUES_PER_PART}",
            values.len()
        )));
    }

    let length = PART_HEADER_SIZE + 2 + values.len() * BYTES_PER_VALUE;
    write_part_header(out, PartType::Values, length);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        out.push(value.kind().to_wire());
    }
    for value in values {
        let raw = match *value {
            Value::Counter(v) | Value::Derive(v) | Value::Absolute(v) => v.to_be_bytes(),
            Value::Gauge(v) => encode_gauge(v),
        };
        out.extend_from_slice(&raw);
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Gauge Codec
// ----------------------------------------------------------------------------

/// Encode a gauge in the legacy x86 little-endian double layout
pub(crate) fn encode_gauge(v: f64) -> [u8; 8] {
    if v.is_nan() {
        NAN_WIRE
    } else {
        v.to_le_bytes()
    }
}

/// Decode a gauge; the special NaN pattern is recognized explicitly
pub(crate) fn decode_gauge(raw: [u8; 8]) -> f64 {
    if raw == NAN_WIRE {
        f64::NAN
    } else {
        f64::from_le_bytes(raw)
    }
}

// ----------------------------------------------------------------------------
// High-Resolution Time
// ----------------------------------------------------------------------------

/// Convert a high-resolution timestamp (2^-30 second ticks) to a duration
pub(crate) fn hr_to_duration(ticks: u64) -> Duration {
    let secs = ticks >> 30;
    let frac = ticks & ((1u64 << 30) - 1);
    let nanos = (frac * 1_000_000_000) >> 30;
    Duration::new(secs, nanos as u32)
}

/// Convert a duration to high-resolution ticks
pub(crate) fn duration_to_hr(d: Duration) -> u64 {
    (d.as_secs() << 30) | (((d.subsec_nanos() as u64) << 30) / 1_000_000_000)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
