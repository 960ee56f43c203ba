//! Fixed-width binary replies: RFC 868 time.
//!
//! The server sends exactly four bytes, a big-endian count of seconds since
//! 1900-01-01T00:00:00Z, and closes.

use super::{unsupported, Codec, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::Operation;
use serde_json::{json, Value};

/// Seconds between the RFC 868 epoch (1900) and the Unix epoch (1970).
pub const EPOCH_OFFSET: u64 = 2_208_988_800;

const WIDTH: usize = 4;

#[derive(Debug, Default)]
pub struct TimeCodec;

impl TimeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a Unix timestamp the way an RFC 868 server would.
    pub fn encode_time(unix_seconds: u64) -> [u8; WIDTH] {
        // The 32-bit counter wraps in 2036; truncation is the wire format.
        ((unix_seconds + EPOCH_OFFSET) as u32).to_be_bytes()
    }
}

impl Codec for TimeCodec {
    fn protocol(&self) -> &'static str {
        "time"
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult {
        if data.len() < WIDTH {
            return DecodeResult::NeedMoreData;
        }
        DecodeResult::Frame(Frame::new(data[..WIDTH].to_vec(), WIDTH))
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        match op.operation.as_str() {
            "get" => Ok(Vec::new()),
            _ => Err(unsupported("time", op)),
        }
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        let bytes: [u8; WIDTH] = frame
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| GateError::framing("time reply must be exactly 4 bytes"))?;
        let seconds = u64::from(u32::from_be_bytes(bytes));
        let mut out = json!({ "seconds_since_1900": seconds });
        if let Some(unix) = seconds.checked_sub(EPOCH_OFFSET) {
            out["unix_seconds"] = json!(unix);
        }
        Ok(out)
    }
}
