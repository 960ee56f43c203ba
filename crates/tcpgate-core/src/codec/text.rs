//! Responses that run until the server closes the connection.
//!
//! Finger (RFC 1288) answers a single query line with free-form text and
//! then closes; the only frame boundary is end of stream. The accumulation
//! buffer's cap bounds how much text a server can push at us.

use super::{unsupported, Codec, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::Operation;
use serde_json::{json, Value};

/// Finger query codec.
#[derive(Debug, Default)]
pub struct FingerCodec;

impl FingerCodec {
    pub fn new() -> Self {
        Self
    }

    /// Build the query line. An empty user lists everyone logged in;
    /// `verbose` adds the RFC 1288 `/W` switch.
    pub fn query_line(user: Option<&str>, verbose: bool) -> GateResult<Vec<u8>> {
        let user = user.unwrap_or("");
        if user.contains(['\r', '\n']) {
            return Err(GateError::framing("finger user must not contain CR or LF"));
        }
        // Forwarding (user@host) would make the backend open connections on
        // our behalf, bypassing destination validation.
        if user.contains('@') {
            return Err(GateError::framing("finger forwarding (user@host) is not allowed"));
        }
        let mut line = String::new();
        if verbose {
            line.push_str("/W ");
        }
        line.push_str(user);
        line.push_str("\r\n");
        Ok(line.into_bytes())
    }
}

impl Codec for FingerCodec {
    fn protocol(&self) -> &'static str {
        "finger"
    }

    fn decode(&mut self, _data: &[u8]) -> DecodeResult {
        DecodeResult::NeedMoreData
    }

    fn decode_eof(&mut self, data: &[u8]) -> DecodeResult {
        DecodeResult::Frame(Frame::new(data.to_vec(), data.len()))
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        match op.operation.as_str() {
            "query" => {
                let verbose = op
                    .params
                    .get("verbose")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Self::query_line(op.opt_str_param("user"), verbose)
            }
            _ => Err(unsupported("finger", op)),
        }
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        let text = frame.text();
        let lines: Vec<&str> = text.lines().collect();
        Ok(json!({ "text": text.trim_end(), "lines": lines }))
    }
}
