//! Delimiter-framed text lines.
//!
//! Frame boundary is `\r\n` (a bare `\n` is accepted as well, since many
//! small services emit Unix line endings). Scanning is bounded by
//! `max_line_length`: a buffer that grows past the cap without a
//! delimiter is rejected instead of scanned forever.

use super::{unsupported, Codec, CodecLimits, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::Operation;
use serde_json::{json, Value};

/// Which line-oriented service the codec talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDialect {
    /// RFC 862: every line sent comes back unchanged.
    Echo,
    /// RFC 867: the server sends one line and closes.
    Daytime,
    /// RFC 864: the server streams lines until the client leaves.
    Chargen,
}

impl LineDialect {
    fn protocol(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Daytime => "daytime",
            Self::Chargen => "chargen",
        }
    }
}

/// Text line codec.
#[derive(Debug)]
pub struct LineCodec {
    dialect: LineDialect,
    max_line_length: usize,
}

impl LineCodec {
    pub fn new(dialect: LineDialect, limits: CodecLimits) -> Self {
        Self {
            dialect,
            max_line_length: limits.max_line_length,
        }
    }

    /// Encode one request line, refusing embedded line breaks so one
    /// operation can never smuggle a second command.
    pub fn encode_line(&self, line: &str) -> GateResult<Vec<u8>> {
        if line.contains(['\r', '\n']) {
            return Err(GateError::framing("line data must not contain CR or LF"));
        }
        if line.len() > self.max_line_length {
            return Err(GateError::framing(format!(
                "line of {} bytes exceeds max line length {}",
                line.len(),
                self.max_line_length
            )));
        }
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }
}

/// Find the next line in `data`, returning `(line_end, frame_end)` where
/// `line_end` excludes the delimiter.
pub(crate) fn find_line(data: &[u8], max_line_length: usize) -> Result<Option<(usize, usize)>, String> {
    // Only the first max_line_length + 2 bytes can hold a legal delimiter.
    let window = data.len().min(max_line_length.saturating_add(2));
    match data[..window].iter().position(|&b| b == b'\n') {
        Some(lf) => {
            let line_end = if lf > 0 && data[lf - 1] == b'\r' { lf - 1 } else { lf };
            if line_end > max_line_length {
                return Err(format!(
                    "line of {line_end} bytes exceeds max line length {max_line_length}"
                ));
            }
            Ok(Some((line_end, lf + 1)))
        }
        None if data.len() > max_line_length.saturating_add(1) => Err(format!(
            "no line delimiter within {max_line_length} bytes"
        )),
        None => Ok(None),
    }
}

impl Codec for LineCodec {
    fn protocol(&self) -> &'static str {
        self.dialect.protocol()
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult {
        match find_line(data, self.max_line_length) {
            Ok(Some((line_end, frame_end))) => {
                DecodeResult::Frame(Frame::new(data[..line_end].to_vec(), frame_end))
            }
            Ok(None) => DecodeResult::NeedMoreData,
            Err(reason) => DecodeResult::Invalid(reason),
        }
    }

    /// A final line without a delimiter is surfaced as an incomplete frame.
    fn decode_eof(&mut self, data: &[u8]) -> DecodeResult {
        if data.is_empty() {
            return DecodeResult::NeedMoreData;
        }
        match self.decode(data) {
            DecodeResult::NeedMoreData => DecodeResult::Frame(Frame {
                payload: data.to_vec(),
                is_complete: false,
                bytes_consumed: data.len(),
            }),
            other => other,
        }
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        match (self.dialect, op.operation.as_str()) {
            (LineDialect::Echo, "send") => self.encode_line(op.str_param("data")?),
            (LineDialect::Daytime, "get") | (LineDialect::Chargen, "sample") => Ok(Vec::new()),
            _ => Err(unsupported(self.protocol(), op)),
        }
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        let mut out = json!({ "line": frame.text() });
        if !frame.is_complete {
            out["complete"] = Value::Bool(false);
        }
        Ok(out)
    }
}
