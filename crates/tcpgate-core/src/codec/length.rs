//! Length-prefixed binary records.
//!
//! Wire format: `[4-byte big-endian length][payload]`, payload CBOR.
//!
//! Decode order matters:
//! 1. wait until the whole 4-byte header is buffered,
//! 2. reject a declared length above `max_frame_size`, before any
//!    payload-sized allocation,
//! 3. only then wait for the payload bytes.

use super::{unsupported, Codec, CodecLimits, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::Operation;
use serde_json::{json, Value};
use std::io::Cursor;

const HEADER_LEN: usize = 4;

/// Encode a serializable value into a length-prefixed CBOR record.
pub fn record_encode<T: serde::Serialize>(value: &T, max_frame_size: usize) -> GateResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    frame_payload(&payload, max_frame_size)
}

/// Prefix an already-encoded payload with its length.
pub fn frame_payload(payload: &[u8], max_frame_size: usize) -> GateResult<Vec<u8>> {
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(GateError::MessageTooLarge {
            size: payload.len(),
            limit: max_frame_size,
        });
    }
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into JSON.
///
/// Goes through `ciborium::Value` so byte strings survive (they render as
/// arrays of numbers rather than failing).
pub fn cbor_to_json(data: &[u8]) -> GateResult<Value> {
    let value: ciborium::Value = ciborium::from_reader(Cursor::new(data))?;
    serde_json::to_value(value)
        .map_err(|e| GateError::framing(format!("CBOR record has no JSON form: {e}")))
}

/// Length-prefixed CBOR record codec.
#[derive(Debug)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            max_frame_size: limits.max_frame_size,
        }
    }
}

impl Codec for LengthPrefixedCodec {
    fn protocol(&self) -> &'static str {
        "records"
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult {
        let Some(header) = data.get(..HEADER_LEN) else {
            return DecodeResult::NeedMoreData;
        };
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared > self.max_frame_size {
            return DecodeResult::Invalid(format!(
                "declared record length {declared} exceeds cap {}",
                self.max_frame_size
            ));
        }
        let total = HEADER_LEN + declared;
        if data.len() < total {
            return DecodeResult::NeedMoreData;
        }
        DecodeResult::Frame(Frame::new(data[HEADER_LEN..total].to_vec(), total))
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        match op.operation.as_str() {
            "send" => {
                let record = op.params.get("record").ok_or_else(|| {
                    GateError::framing("operation 'send' requires parameter 'record'")
                })?;
                record_encode(record, self.max_frame_size)
            }
            _ => Err(unsupported("records", op)),
        }
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        match cbor_to_json(&frame.payload) {
            Ok(record) => Ok(json!({ "record": record })),
            Err(_) => Ok(json!({ "hex": hex::encode(&frame.payload) })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{decode_split, decode_whole};
    use super::*;
    use crate::buffer::AccumulationBuffer;

    fn codec(cap: usize) -> LengthPrefixedCodec {
        LengthPrefixedCodec::new(CodecLimits {
            max_frame_size: cap,
            ..CodecLimits::default()
        })
    }

    #[test]
    fn round_trip_record() {
        let record = json!({"name": "hello", "value": 42, "tags": ["a", "b"], "ratio": 0.5});
        let mut c = codec(1024);
        let op = Operation::new("send").with_param("record", record.clone());
        let wire = c.encode_request(&op).unwrap();
        let frame = decode_whole(&mut c, &wire);
        assert_eq!(frame.bytes_consumed, wire.len());
        assert_eq!(c.render(&frame).unwrap(), json!({ "record": record }));
    }

    #[test]
    fn every_split_point_yields_same_frame() {
        let wire = record_encode(&json!({"k": "v", "n": [1, 2, 3]}), 1024).unwrap();
        let expected = decode_whole(&mut codec(1024), &wire);
        for k in 0..=wire.len() {
            assert_eq!(decode_split(&mut codec(1024), &wire, k), expected, "split at {k}");
        }
    }

    #[test]
    fn header_needed_before_length_is_read() {
        let mut c = codec(16);
        assert_eq!(c.decode(&[0xff, 0xff, 0xff]), DecodeResult::NeedMoreData);
    }

    #[test]
    fn oversized_declaration_rejected_before_payload() {
        let cap = 64;
        let mut c = codec(cap);
        let header = ((cap + 1) as u32).to_be_bytes();
        // No payload bytes at all: the header alone must be enough to reject.
        assert!(matches!(c.decode(&header), DecodeResult::Invalid(_)));

        let mut buf = AccumulationBuffer::new(128);
        buf.extend(&header).unwrap();
        assert!(c.decode_available(&mut buf).is_err());
    }

    #[test]
    fn cap_is_inclusive() {
        let cap = 8;
        let wire = frame_payload(&[7u8; 8], cap).unwrap();
        let f = decode_whole(&mut codec(cap), &wire);
        assert_eq!(f.payload.len(), 8);
        assert!(frame_payload(&[0u8; 9], cap).is_err());
    }

    #[test]
    fn zero_length_record() {
        let wire = frame_payload(&[], 8).unwrap();
        let f = decode_whole(&mut codec(8), &wire);
        assert!(f.payload.is_empty());
        assert_eq!(f.bytes_consumed, 4);
    }

    #[test]
    fn back_to_back_records() {
        let mut wire = record_encode(&json!("a"), 64).unwrap();
        wire.extend(record_encode(&json!("b"), 64).unwrap());
        wire.extend_from_slice(&[0, 0]);
        let mut buf = AccumulationBuffer::new(64);
        buf.extend(&wire).unwrap();
        let mut c = codec(64);
        let frames = c.decode_available(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn non_cbor_payload_renders_as_hex() {
        let f = Frame::new(vec![0xff, 0xff], 6);
        let v = codec(64).render(&f).unwrap();
        assert_eq!(v, json!({"hex": "ffff"}));
    }
}
