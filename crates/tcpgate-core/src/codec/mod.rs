//! Codec framework: turning backend byte streams into frames and
//! operations into backend bytes.
//!
//! # Contract
//!
//! A codec implements [`Codec::decode`], a pure inspection of the bytes
//! buffered so far that returns one of:
//!
//! - [`DecodeResult::NeedMoreData`]: no complete frame yet. The codec must
//!   not change any state in this case, so that a later call with more bytes
//!   produces exactly the frame a single call with all bytes would have.
//! - [`DecodeResult::Frame`]: one frame, reporting how many bytes it spans.
//! - [`DecodeResult::Invalid`]: the bytes can never form a valid frame.
//!
//! The provided [`Codec::try_decode_frame`] wraps `decode`, checks that the
//! reported `bytes_consumed` fits inside the buffer, and drops exactly those
//! bytes. [`Codec::decode_available`] repeats that until the buffer runs dry
//! so server-push protocols can yield several frames from one read.
//!
//! # Codecs
//!
//! - [`line`]: delimiter-framed text lines (echo, daytime, chargen).
//! - [`text`]: everything until the peer closes (finger).
//! - [`fixed`]: fixed-width binary (RFC 868 time).
//! - [`length`]: u32 length prefix + CBOR record body.
//! - [`pop3`]: greeting, credential negotiation, then commands.
//! - [`resp`]: Redis RESP2 including pub/sub push messages.

pub mod fixed;
pub mod length;
pub mod line;
pub mod pop3;
pub mod resp;
pub mod text;

use crate::buffer::AccumulationBuffer;
use crate::error::{GateError, GateResult};
use crate::messages::{Credentials, Operation};
use serde_json::Value;

/// Size limits handed to every codec at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Largest single frame payload a codec will accept.
    pub max_frame_size: usize,
    /// Longest text line (delimiter excluded).
    pub max_line_length: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            max_line_length: 8 * 1024,
        }
    }
}

/// One protocol-level unit extracted from a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    /// `false` only for a trailing fragment surfaced at end of stream.
    pub is_complete: bool,
    /// Bytes of the accumulation buffer this frame spans (header and
    /// delimiters included).
    pub bytes_consumed: usize,
}

impl Frame {
    pub fn new(payload: Vec<u8>, bytes_consumed: usize) -> Self {
        Self {
            payload,
            is_complete: true,
            bytes_consumed,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    NeedMoreData,
    Frame(Frame),
    Invalid(String),
}

/// What the session should do with a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Hand the frame to the client.
    Deliver(Frame),
    /// The frame was part of the protocol's own negotiation; write these
    /// bytes to the backend (possibly none) and keep reading.
    Reply(Vec<u8>),
}

/// A wire protocol spoken to a backend service.
///
/// One instance per session; it owns whatever negotiation state the
/// protocol needs and is never shared between sessions.
pub trait Codec: Send {
    /// Registry identifier, e.g. `"pop3"`.
    fn protocol(&self) -> &'static str;

    /// Inspect buffered bytes for one frame without consuming them.
    fn decode(&mut self, data: &[u8]) -> DecodeResult;

    /// Called once the backend has closed its side with `data` still
    /// buffered. The default treats leftovers as a truncated frame.
    fn decode_eof(&mut self, data: &[u8]) -> DecodeResult {
        if data.is_empty() {
            DecodeResult::NeedMoreData
        } else {
            DecodeResult::Invalid(format!(
                "connection closed with {} bytes of an incomplete frame",
                data.len()
            ))
        }
    }

    /// Bytes for one client operation.
    ///
    /// # Errors
    ///
    /// [`GateError::Framing`] for unknown operations or bad parameters,
    /// [`GateError::Handshake`] if the protocol is not ready for commands.
    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>>;

    /// Structured rendering of a delivered frame for the response envelope.
    fn render(&self, frame: &Frame) -> GateResult<Value>;

    /// Bytes to send right after connecting. Protocols where the server
    /// speaks first return nothing.
    fn start(&mut self, _auth: Option<&Credentials>) -> GateResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Whether negotiation has finished and operations may be encoded.
    fn is_ready(&self) -> bool {
        true
    }

    /// Route a decoded frame either to the client or back into the
    /// protocol's own negotiation.
    fn advance(&mut self, frame: Frame) -> GateResult<Advance> {
        Ok(Advance::Deliver(frame))
    }

    /// Decode one frame from `buf` and drop the bytes it spans.
    fn try_decode_frame(&mut self, buf: &mut AccumulationBuffer) -> DecodeResult {
        let result = self.decode(buf.as_slice());
        settle(result, buf)
    }

    /// End-of-stream variant of [`Codec::try_decode_frame`].
    fn try_decode_eof(&mut self, buf: &mut AccumulationBuffer) -> DecodeResult {
        let result = self.decode_eof(buf.as_slice());
        settle(result, buf)
    }

    /// Decode every complete frame currently buffered.
    ///
    /// # Errors
    ///
    /// [`GateError::Framing`] on the first invalid frame.
    fn decode_available(&mut self, buf: &mut AccumulationBuffer) -> GateResult<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.try_decode_frame(buf) {
                DecodeResult::NeedMoreData => return Ok(frames),
                DecodeResult::Frame(frame) => frames.push(frame),
                DecodeResult::Invalid(reason) => return Err(GateError::framing(reason)),
            }
        }
    }
}

/// Apply a decode result to the buffer, enforcing `bytes_consumed <= len`.
fn settle(result: DecodeResult, buf: &mut AccumulationBuffer) -> DecodeResult {
    match result {
        DecodeResult::Frame(frame) => {
            if frame.bytes_consumed > buf.len() {
                return DecodeResult::Invalid(format!(
                    "decoder reported {} bytes consumed from a {}-byte buffer",
                    frame.bytes_consumed,
                    buf.len()
                ));
            }
            match buf.consume(frame.bytes_consumed) {
                Ok(()) => DecodeResult::Frame(frame),
                Err(e) => DecodeResult::Invalid(e.to_string()),
            }
        }
        other => other,
    }
}

/// Reject operations a codec does not implement.
pub(crate) fn unsupported(protocol: &str, op: &Operation) -> GateError {
    GateError::framing(format!(
        "protocol '{protocol}' does not support operation '{}'",
        op.operation
    ))
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Reports consuming more than it was given.
    struct Liar;

    impl Codec for Liar {
        fn protocol(&self) -> &'static str {
            "liar"
        }
        fn decode(&mut self, data: &[u8]) -> DecodeResult {
            DecodeResult::Frame(Frame::new(data.to_vec(), data.len() + 1))
        }
        fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
            Err(unsupported("liar", op))
        }
        fn render(&self, _frame: &Frame) -> GateResult<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn over_reported_consumption_is_invalid() {
        let mut buf = AccumulationBuffer::new(8);
        buf.extend(b"abc").unwrap();
        let mut codec = Liar;
        assert!(matches!(
            codec.try_decode_frame(&mut buf),
            DecodeResult::Invalid(_)
        ));
        assert_eq!(buf.len(), 3, "buffer must be untouched");
    }

    #[test]
    fn decode_available_yields_every_frame() {
        let mut codec = line::LineCodec::new(line::LineDialect::Echo, CodecLimits::default());
        let mut buf = AccumulationBuffer::new(64);
        buf.extend(b"one\r\ntwo\r\nthr").unwrap();
        let frames = codec.decode_available(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"one");
        assert_eq!(frames[1].payload, b"two");
        assert_eq!(buf.as_slice(), b"thr");
    }
}
