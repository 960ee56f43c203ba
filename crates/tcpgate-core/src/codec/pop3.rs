//! POP3 (RFC 1939): a greeting, a negotiation phase, then commands.
//!
//! ```text
//! Greeting ──+OK──▶ Negotiating ──+OK──▶ Ready ──QUIT──▶ Closed
//!     │                  │
//!   -ERR               -ERR
//!     ▼                  ▼
//!  ProtocolHandshake error
//! ```
//!
//! Negotiation sends `USER`/`PASS` when the client supplied credentials and
//! `CAPA` otherwise. Every command has a known reply shape (one status line,
//! or a status line followed by a dot-terminated block), tracked in a queue
//! so pipelined replies are framed correctly.

use super::line::find_line;
use super::{unsupported, Advance, Codec, CodecLimits, DecodeResult, Frame};
use crate::error::{GateError, GateResult};
use crate::messages::{Credentials, Operation};
use serde_json::{json, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3Phase {
    Greeting,
    Negotiating(NegotiationStep),
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    User,
    Pass,
    Capa,
}

/// Shape of the reply a pending command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Single,
    Multi,
}

/// POP3 client-side codec.
#[derive(Debug)]
pub struct Pop3Codec {
    phase: Pop3Phase,
    pending: VecDeque<Reply>,
    credentials: Option<Credentials>,
    capabilities: Vec<String>,
    limits: CodecLimits,
}

impl Pop3Codec {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            phase: Pop3Phase::Greeting,
            pending: VecDeque::from([Reply::Single]),
            credentials: None,
            capabilities: Vec::new(),
            limits,
        }
    }

    pub fn phase(&self) -> Pop3Phase {
        self.phase
    }

    /// Capabilities advertised in reply to `CAPA`, if negotiation used it.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn command(&mut self, line: &str, reply: Reply) -> GateResult<Vec<u8>> {
        if line.contains(['\r', '\n']) {
            return Err(GateError::framing("POP3 arguments must not contain CR or LF"));
        }
        self.pending.push_back(reply);
        Ok(format!("{line}\r\n").into_bytes())
    }

    /// Decode a multi-line block that starts at `start`; returns the
    /// unstuffed body lines and the end offset of the terminating `.` line.
    fn scan_block(&self, data: &[u8], start: usize) -> Result<Option<(Vec<Vec<u8>>, usize)>, String> {
        let mut lines = Vec::new();
        let mut pos = start;
        loop {
            if pos - start > self.limits.max_frame_size {
                return Err(format!(
                    "multi-line reply exceeds {} bytes",
                    self.limits.max_frame_size
                ));
            }
            let Some((line_end, next)) = find_line(&data[pos..], self.limits.max_line_length)? else {
                return Ok(None);
            };
            let line = &data[pos..pos + line_end];
            pos += next;
            if line == b"." {
                return Ok(Some((lines, pos)));
            }
            let unstuffed = line.strip_prefix(b".").unwrap_or(line);
            lines.push(unstuffed.to_vec());
        }
    }

    fn status(frame: &Frame) -> (bool, String) {
        let text = frame.text();
        let first = text.lines().next().unwrap_or("");
        if let Some(rest) = first.strip_prefix("+OK") {
            (true, rest.trim().to_string())
        } else {
            (false, first.strip_prefix("-ERR").unwrap_or(first).trim().to_string())
        }
    }

    fn message_id(op: &Operation, key: &str) -> GateResult<Option<u64>> {
        match op.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| GateError::framing(format!("parameter '{key}' must be a positive integer"))),
            Some(Value::String(s)) => s
                .parse::<u64>()
                .map(Some)
                .map_err(|_| GateError::framing(format!("parameter '{key}' must be a positive integer"))),
            Some(_) => Err(GateError::framing(format!("parameter '{key}' must be a positive integer"))),
        }
    }

    fn required_id(op: &Operation, key: &str) -> GateResult<u64> {
        Self::message_id(op, key)?.ok_or_else(|| {
            GateError::framing(format!("operation '{}' requires parameter '{key}'", op.operation))
        })
    }
}

impl Codec for Pop3Codec {
    fn protocol(&self) -> &'static str {
        "pop3"
    }

    fn decode(&mut self, data: &[u8]) -> DecodeResult {
        let (status_end, after_status) = match find_line(data, self.limits.max_line_length) {
            Ok(Some(found)) => found,
            Ok(None) => return DecodeResult::NeedMoreData,
            Err(reason) => return DecodeResult::Invalid(reason),
        };
        let status = &data[..status_end];
        let ok = status.starts_with(b"+OK");
        if !ok && !status.starts_with(b"-ERR") {
            return DecodeResult::Invalid(format!(
                "POP3 reply must start with +OK or -ERR, got {:?}",
                String::from_utf8_lossy(&status[..status.len().min(32)])
            ));
        }

        let expect = self.pending.front().copied().unwrap_or(Reply::Single);
        let mut payload = status.to_vec();
        let consumed = if ok && expect == Reply::Multi {
            match self.scan_block(data, after_status) {
                Ok(Some((lines, end))) => {
                    for line in lines {
                        payload.extend_from_slice(b"\r\n");
                        payload.extend_from_slice(&line);
                    }
                    end
                }
                Ok(None) => return DecodeResult::NeedMoreData,
                Err(reason) => return DecodeResult::Invalid(reason),
            }
        } else {
            after_status
        };

        self.pending.pop_front();
        DecodeResult::Frame(Frame::new(payload, consumed))
    }

    fn start(&mut self, auth: Option<&Credentials>) -> GateResult<Vec<u8>> {
        if let Some(creds) = auth {
            if creds.username.contains(['\r', '\n', ' ']) || creds.password.contains(['\r', '\n']) {
                return Err(GateError::handshake("credentials contain forbidden characters"));
            }
        }
        self.credentials = auth.cloned();
        Ok(Vec::new())
    }

    fn is_ready(&self) -> bool {
        matches!(self.phase, Pop3Phase::Ready | Pop3Phase::Closed)
    }

    fn advance(&mut self, frame: Frame) -> GateResult<Advance> {
        let (ok, message) = Self::status(&frame);
        match self.phase {
            Pop3Phase::Greeting => {
                if !ok {
                    return Err(GateError::handshake(format!("server refused session: {message}")));
                }
                let next = match self.credentials.as_ref().map(|c| c.username.clone()) {
                    Some(user) => {
                        self.phase = Pop3Phase::Negotiating(NegotiationStep::User);
                        self.command(&format!("USER {user}"), Reply::Single)?
                    }
                    None => {
                        self.phase = Pop3Phase::Negotiating(NegotiationStep::Capa);
                        self.command("CAPA", Reply::Multi)?
                    }
                };
                Ok(Advance::Reply(next))
            }
            Pop3Phase::Negotiating(NegotiationStep::User) => {
                if !ok {
                    return Err(GateError::handshake(format!("USER rejected: {message}")));
                }
                let password = self
                    .credentials
                    .as_ref()
                    .map(|c| c.password.clone())
                    .unwrap_or_default();
                self.phase = Pop3Phase::Negotiating(NegotiationStep::Pass);
                Ok(Advance::Reply(self.command(&format!("PASS {password}"), Reply::Single)?))
            }
            Pop3Phase::Negotiating(NegotiationStep::Pass) => {
                if !ok {
                    return Err(GateError::handshake(format!("authentication rejected: {message}")));
                }
                self.phase = Pop3Phase::Ready;
                Ok(Advance::Reply(Vec::new()))
            }
            Pop3Phase::Negotiating(NegotiationStep::Capa) => {
                // CAPA is optional (RFC 2449); a server without it is still usable.
                if ok {
                    self.capabilities = frame.text().lines().skip(1).map(str::to_string).collect();
                }
                self.phase = Pop3Phase::Ready;
                Ok(Advance::Reply(Vec::new()))
            }
            Pop3Phase::Ready | Pop3Phase::Closed => Ok(Advance::Deliver(frame)),
        }
    }

    fn encode_request(&mut self, op: &Operation) -> GateResult<Vec<u8>> {
        match self.phase {
            Pop3Phase::Ready => {}
            Pop3Phase::Closed => return Err(GateError::handshake("POP3 session already quit")),
            _ => {
                return Err(GateError::handshake(
                    "POP3 command sent before negotiation finished",
                ))
            }
        }
        match op.operation.as_str() {
            "stat" => self.command("STAT", Reply::Single),
            "noop" => self.command("NOOP", Reply::Single),
            "rset" => self.command("RSET", Reply::Single),
            "capa" => self.command("CAPA", Reply::Multi),
            "list" => match Self::message_id(op, "id")? {
                Some(id) => self.command(&format!("LIST {id}"), Reply::Single),
                None => self.command("LIST", Reply::Multi),
            },
            "uidl" => match Self::message_id(op, "id")? {
                Some(id) => self.command(&format!("UIDL {id}"), Reply::Single),
                None => self.command("UIDL", Reply::Multi),
            },
            "retr" => {
                let id = Self::required_id(op, "id")?;
                self.command(&format!("RETR {id}"), Reply::Multi)
            }
            "top" => {
                let id = Self::required_id(op, "id")?;
                let lines = Self::message_id(op, "lines")?.unwrap_or(0);
                self.command(&format!("TOP {id} {lines}"), Reply::Multi)
            }
            "dele" => {
                let id = Self::required_id(op, "id")?;
                self.command(&format!("DELE {id}"), Reply::Single)
            }
            "quit" => {
                let bytes = self.command("QUIT", Reply::Single)?;
                self.phase = Pop3Phase::Closed;
                Ok(bytes)
            }
            _ => Err(unsupported("pop3", op)),
        }
    }

    fn render(&self, frame: &Frame) -> GateResult<Value> {
        let (ok, message) = Self::status(frame);
        let text = frame.text();
        let lines: Vec<&str> = text.split("\r\n").skip(1).collect();
        Ok(json!({ "ok": ok, "message": message, "lines": lines }))
    }
}
