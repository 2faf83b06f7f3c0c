//! The SFU wire packet: the only place this framing is produced or parsed.
//!
//! Three logical fields — a 32-bit sequence number, a 32-bit timestamp, and a
//! length-prefixed opaque payload — all big-endian. Encoding always produces
//! a self-contained buffer with a fresh payload copy; decoding always returns
//! a fresh payload copy, never a view into the incoming frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const HEADER_LEN: usize = 4 + 4 + 4; // sequence + timestamp + payload length prefix

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("declared payload length {declared} exceeds remaining {remaining} bytes")]
    TruncatedPayload { declared: usize, remaining: usize },
}

/// A decoded packet. `payload` is always an owned, freshly allocated copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Encodes and decodes [`Packet`]s. Stateless; safe to share across sessions.
pub struct PacketCodec;

impl PacketCodec {
    /// Encodes `sequence`, `timestamp`, and `payload` into a self-contained
    /// framed message. `payload` is copied, never aliased.
    pub fn encode(sequence: u32, timestamp: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(sequence);
        buf.put_u32(timestamp);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decodes a framed message, returning an owned copy of the payload.
    /// If the payload has odd length, the terminal byte is dropped.
    pub fn decode(mut frame: &[u8]) -> Result<Packet, CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::TooShort {
                need: HEADER_LEN,
                got: frame.len(),
            });
        }
        let sequence = frame.get_u32();
        let timestamp = frame.get_u32();
        let declared_len = frame.get_u32() as usize;
        if declared_len > frame.len() {
            return Err(CodecError::TruncatedPayload {
                declared: declared_len,
                remaining: frame.len(),
            });
        }
        let mut payload = Vec::with_capacity(declared_len);
        payload.extend_from_slice(&frame[..declared_len]);
        if payload.len() % 2 == 1 {
            payload.pop();
        }
        Ok(Packet {
            sequence,
            timestamp,
            payload: Bytes::from(payload),
        })
    }

    /// Convenience: a zero-length-payload packet used as an end-of-stream marker.
    pub fn end_of_stream(sequence: u32, timestamp: u32) -> Bytes {
        Self::encode(sequence, timestamp, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_even_length_payload() {
        let payload = [0x10u8, 0x00, 0x20, 0x00];
        let framed = PacketCodec::encode(1, 1000, &payload);
        let decoded = PacketCodec::decode(&framed).unwrap();
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.timestamp, 1000);
        assert_eq!(decoded.payload.as_ref(), &payload);
    }

    #[test]
    fn decode_truncates_terminal_odd_byte() {
        let payload = [0x01u8, 0x02, 0x03];
        let framed = PacketCodec::encode(0, 0, &payload);
        let decoded = PacketCodec::decode(&framed).unwrap();
        assert_eq!(decoded.payload.as_ref(), &[0x01, 0x02]);
    }

    #[test]
    fn end_of_stream_has_zero_length_payload() {
        let framed = PacketCodec::end_of_stream(5, 42);
        let decoded = PacketCodec::decode(&framed).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.sequence, 5);
    }

    #[test]
    fn decode_rejects_short_frames() {
        let err = PacketCodec::decode(&[0u8, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::TooShort { .. }));
    }

    #[test]
    fn decode_rejects_declared_length_past_end() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(100);
        let err = PacketCodec::decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedPayload { .. }));
    }

    #[test]
    fn decoded_payload_is_not_a_view_into_the_frame() {
        let mut frame = PacketCodec::encode(0, 0, &[1, 2, 3, 4]).to_vec();
        let decoded = PacketCodec::decode(&frame).unwrap();
        frame.fill(0xff);
        assert_eq!(decoded.payload.as_ref(), &[1, 2, 3, 4]);
    }
}
