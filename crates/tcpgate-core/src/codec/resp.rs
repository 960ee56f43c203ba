//! Redis serialization protocol (RESP2), including pub/sub push messages.
//!
//! Once a connection subscribes, the server sends `message` arrays
//! unsolicited, so one read can carry any number of frames; the framework's
//! [`Codec::decode_available`] drains them all.
//!
//! Untrusted lengths are checked before use: a bulk string longer than
//! `max_frame_size`, an array longer than [`MAX_ARRAY_LEN`], or nesting
//! deeper than [`MAX_DEPTH`] is rejected without allocating for it.

use super::line::find_line;
use super::{unsupported, Advance, Codec, CodecLimits, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::{Credentials, Operation};
use serde_json::{json, Map, Value};

pub const MAX_DEPTH: usize = 32;
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Simple(s) => Value::String(s.clone()),
            Self::Error(e) => json!({ "error": e }),
            Self::Integer(i) => json!(i),
            Self::Bulk(None) | Self::Array(None) => Value::Null,
            Self::Bulk(Some(b)) => match std::str::from_utf8(b) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => json!({ "hex": hex::encode(b) }),
            },
            Self::Array(Some(items)) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

/// Incremental RESP2 parser over a borrowed buffer.
struct Parser<'a> {
    data: &'a [u8],
    limits: CodecLimits,
}

type Parsed = Result<Option<(RespValue, usize)>, String>;

impl<'a> Parser<'a> {
    fn header(&self, pos: usize) -> Result<Option<(u8, &'a [u8], usize)>, String> {
        let Some(rest) = self.data.get(pos..) else {
            return Ok(None);
        };
        let Some((line_end, next)) = find_line(rest, self.limits.max_line_length)? else {
            return Ok(None);
        };
        if line_end == 0 {
            return Err("empty RESP header line".to_string());
        }
        Ok(Some((rest[0], &rest[1..line_end], pos + next)))
    }

    fn length(raw: &[u8]) -> Result<i64, String> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| format!("invalid RESP length {:?}", String::from_utf8_lossy(raw)))
    }

    fn value(&self, pos: usize, depth: usize) -> Parsed {
        if depth > MAX_DEPTH {
            return Err(format!("RESP nesting deeper than {MAX_DEPTH}"));
        }
        let Some((tag, body, next)) = self.header(pos)? else {
            return Ok(None);
        };
        let text = || String::from_utf8_lossy(body).into_owned();
        match tag {
            b'+' => Ok(Some((RespValue::Simple(text()), next))),
            b'-' => Ok(Some((RespValue::Error(text()), next))),
            b':' => {
                let n = Self::length(body)?;
                Ok(Some((RespValue::Integer(n), next)))
            }
            b'$' => {
                let len = Self::length(body)?;
                if len == -1 {
                    return Ok(Some((RespValue::Bulk(None), next)));
                }
                let len = usize::try_from(len).map_err(|_| format!("negative bulk length {len}"))?;
                if len > self.limits.max_frame_size {
                    return Err(format!(
                        "bulk length {len} exceeds cap {}",
                        self.limits.max_frame_size
                    ));
                }
                let end = next + len;
                if self.data.len() < end + 2 {
                    return Ok(None);
                }
                if &self.data[end..end + 2] != b"\r\n" {
                    return Err("bulk string not terminated by CRLF".to_string());
                }
                Ok(Some((RespValue::Bulk(Some(self.data[next..end].to_vec())), end + 2)))
            }
            b'*' => {
                let count = Self::length(body)?;
                if count == -1 {
                    return Ok(Some((RespValue::Array(None), next)));
                }
                let count =
                    usize::try_from(count).map_err(|_| format!("negative array length {count}"))?;
                if count > MAX_ARRAY_LEN {
                    return Err(format!("array length {count} exceeds cap {MAX_ARRAY_LEN}"));
                }
                let mut items = Vec::with_capacity(count.min(64));
                let mut cursor = next;
                for _ in 0..count {
                    let Some((item, after)) = self.value(cursor, depth + 1)? else {
                        return Ok(None);
                    };
                    items.push(item);
                    cursor = after;
                }
                Ok(Some((RespValue::Array(Some(items)), cursor)))
            }
            other => Err(format!("unknown RESP type byte 0x{other:02x}")),
        }
    }
}

/// Parse one complete value from the front of `data`.
pub fn parse(data: &[u8], limits: CodecLimits) -> Parsed {
    Parser { data, limits }.value(0, 0)
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Redis codec. Ready immediately unless credentials were supplied, in
/// which case an `AUTH` round trip comes first.
#[derive(Debug)]
pub struct RespCodec {
    limits: CodecLimits,
    awaiting_auth: bool,
}

impl RespCodec {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            awaiting_auth: false,
        }
    }

    fn string_list(op: &Operation, key: &str) -> GateResult<Vec<String>> {
        let Some(value) = op.params.get(key) else {
            return Ok(Vec::new());
        };
        let items = match value {
            Value::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                _ => Err(GateError::framing(format!(
                    "parameter '{key}' must hold strings or numbers"
                ))),
            })
            .collect()
    }

    fn with_verb(verb: &str, rest: Vec<String>) -> Vec<u8> {
        let mut args = Vec::with_capacity(rest.len() + 1);
        args.push(verb.to_string());
        args.extend(rest);
        encode_command(&args)
    }

    /// Recognise pub/sub push arrays.
    fn render_push(items: &[RespValue]) -> Option<Value> {
        let kind = items.first()?.as_text()?;
        let mut out = Map::new();
        match (kind.as_str(), items.len()) {
            ("message", 3) => {
                out.insert("channel".into(), items[1].to_json());
                out.insert("payload".into(), items[2].to_json());
            }
            ("pmessage", 4) => {
                out.insert("pattern".into(), items[1].to_json());
                out.insert("channel".into(), items[2].to_json());
                out.insert("payload".into(), items[3].to_json());
            }
            ("subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe", 3) => {
                out.insert("channel".into(), items[1].to_json());
                out.insert("count".into(), items[2].to_json());
            }
            _ => return None,
        }
        out.insert("kind".into(), Value::String(kind));
        Some(Value::Object(out))
    }
}

impl Codec for RespCodec {
    fn protocol(&self) -> &'static str {
        "redis"
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult {
        match parse(data, self.limits) {
            Ok(Some((_, end))) => DecodeResult::Frame(Frame::new(data[..end].to_vec(), end)),
            Ok(None) => DecodeResult::NeedMoreData,
            Err(reason) => DecodeResult::Invalid(reason),
        }
    }

    fn start(&mut self, auth: Option<&Credentials>) -> GateResult<Vec<u8>> {
        match auth {
            Some(creds) => {
                self.awaiting_auth = true;
                Ok(encode_command(&["AUTH", &creds.username, &creds.password]))
            }
            None => Ok(Vec::new()),
        }
    }

    fn is_ready(&self) -> bool {
        !self.awaiting_auth
    }

    fn advance(&mut self, frame: Frame) -> GateResult<Advance> {
        if !self.awaiting_auth {
            return Ok(Advance::Deliver(frame));
        }
        match parse(&frame.payload, self.limits) {
            Ok(Some((RespValue::Simple(_), _))) => {
                self.awaiting_auth = false;
                Ok(Advance::Reply(Vec::new()))
            }
            Ok(Some((RespValue::Error(e), _))) => {
                Err(GateError::handshake(format!("AUTH rejected: {e}")))
            }
            _ => Err(GateError::handshake("unexpected reply to AUTH")),
        }
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        if self.awaiting_auth {
            return Err(GateError::handshake("command sent before AUTH completed"));
        }
        let bytes = match op.operation.as_str() {
            "command" => {
                let args = Self::string_list(op, "args")?;
                if args.is_empty() {
                    return Err(GateError::framing("operation 'command' requires non-empty 'args'"));
                }
                encode_command(&args)
            }
            "ping" => encode_command(&["PING"]),
            "publish" => {
                encode_command(&["PUBLISH", op.str_param("channel")?, op.str_param("message")?])
            }
            "subscribe" | "psubscribe" => {
                let key = if op.operation == "subscribe" { "channels" } else { "patterns" };
                let names = Self::string_list(op, key)?;
                if names.is_empty() {
                    return Err(GateError::framing(format!(
                        "operation '{}' requires non-empty '{key}'",
                        op.operation
                    )));
                }
                Self::with_verb(&op.operation.to_uppercase(), names)
            }
            "unsubscribe" => Self::with_verb("UNSUBSCRIBE", Self::string_list(op, "channels")?),
            "punsubscribe" => Self::with_verb("PUNSUBSCRIBE", Self::string_list(op, "patterns")?),
            _ => return Err(unsupported("redis", op)),
        };
        if bytes.len() > self.limits.max_frame_size {
            return Err(GateError::MessageTooLarge {
                size: bytes.len(),
                limit: self.limits.max_frame_size,
            });
        }
        Ok(bytes)
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        let (value, _) = parse(&frame.payload, self.limits)
            .map_err(GateError::framing)?
            .ok_or_else(|| GateError::internal("rendered an incomplete RESP frame"))?;
        if let RespValue::Array(Some(items)) = &value {
            if let Some(push) = Self::render_push(items) {
                return Ok(push);
            }
        }
        Ok(json!({ "value": value.to_json() }))
    }
}
