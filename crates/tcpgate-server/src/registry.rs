//! Protocol registry: the closed set of protocols the gateway speaks.
//!
//! Each entry maps a protocol identifier to its default port, the session
//! modes it supports, the one-shot operations it accepts, and the codec
//! constructor. Per-protocol default ports can be overridden from config.

use std::collections::HashMap;
use tcpgate_core::codec::fixed::TimeCodec;
use tcpgate_core::codec::length::LengthPrefixedCodec;
use tcpgate_core::codec::line::{LineCodec, LineDialect};
use tcpgate_core::codec::pop3::Pop3Codec;
use tcpgate_core::codec::resp::RespCodec;
use tcpgate_core::codec::text::FingerCodec;
use tcpgate_core::{Codec, CodecLimits, GateError, GateResult};

/// Which session modes a protocol supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Byte tunnel only; no codec.
    Raw,
    /// Codec-driven in both modes.
    Structured,
    /// One-shot exchanges go through the codec; interactive sessions are a
    /// raw tunnel.
    RawOrStructured,
}

type CodecCtor = fn(CodecLimits) -> Box<dyn Codec>;

/// Static description of one protocol.
#[derive(Debug)]
pub struct ProtocolSpec {
    pub id: &'static str,
    pub default_port: Option<u16>,
    pub kind: ProtocolKind,
    pub operations: &'static [&'static str],
    codec: Option<CodecCtor>,
}

impl ProtocolSpec {
    /// Fresh codec for one session, or `None` for raw-only protocols.
    pub fn codec(&self, limits: CodecLimits) -> Option<Box<dyn Codec>> {
        self.codec.map(|ctor| ctor(limits))
    }

    /// Whether an interactive session carries raw bytes.
    pub fn interactive_is_raw(&self) -> bool {
        matches!(self.kind, ProtocolKind::Raw | ProtocolKind::RawOrStructured)
    }

    pub fn supports_exchange(&self, operation: &str) -> bool {
        self.codec.is_some() && self.operations.contains(&operation)
    }
}

fn echo(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(LineCodec::new(LineDialect::Echo, limits))
}
fn daytime(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(LineCodec::new(LineDialect::Daytime, limits))
}
fn chargen(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(LineCodec::new(LineDialect::Chargen, limits))
}
fn time(_limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(TimeCodec::new())
}
fn finger(_limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(FingerCodec::new())
}
fn pop3(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(Pop3Codec::new(limits))
}
fn redis(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(RespCodec::new(limits))
}
fn records(limits: CodecLimits) -> Box<dyn Codec> {
    Box::new(LengthPrefixedCodec::new(limits))
}

static PROTOCOLS: &[ProtocolSpec] = &[
    ProtocolSpec {
        id: "tcp",
        default_port: None,
        kind: ProtocolKind::Raw,
        operations: &[],
        codec: None,
    },
    ProtocolSpec {
        id: "echo",
        default_port: Some(7),
        kind: ProtocolKind::RawOrStructured,
        operations: &["send"],
        codec: Some(echo),
    },
    ProtocolSpec {
        id: "discard",
        default_port: Some(9),
        kind: ProtocolKind::Raw,
        operations: &[],
        codec: None,
    },
    ProtocolSpec {
        id: "daytime",
        default_port: Some(13),
        kind: ProtocolKind::Structured,
        operations: &["get"],
        codec: Some(daytime),
    },
    ProtocolSpec {
        id: "chargen",
        default_port: Some(19),
        kind: ProtocolKind::RawOrStructured,
        operations: &["sample"],
        codec: Some(chargen),
    },
    ProtocolSpec {
        id: "time",
        default_port: Some(37),
        kind: ProtocolKind::Structured,
        operations: &["get"],
        codec: Some(time),
    },
    ProtocolSpec {
        id: "finger",
        default_port: Some(79),
        kind: ProtocolKind::Structured,
        operations: &["query"],
        codec: Some(finger),
    },
    ProtocolSpec {
        id: "pop3",
        default_port: Some(110),
        kind: ProtocolKind::Structured,
        operations: &["stat", "list", "uidl", "retr", "top", "noop", "capa"],
        codec: Some(pop3),
    },
    ProtocolSpec {
        id: "redis",
        default_port: Some(6379),
        kind: ProtocolKind::Structured,
        operations: &["command", "ping", "publish"],
        codec: Some(redis),
    },
    ProtocolSpec {
        id: "records",
        default_port: None,
        kind: ProtocolKind::Structured,
        operations: &["send"],
        codec: Some(records),
    },
];

/// Registry lookups with config overrides applied.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    port_overrides: HashMap<String, u16>,
}

impl Registry {
    pub fn new(port_overrides: HashMap<String, u16>) -> Self {
        Self { port_overrides }
    }

    pub fn all() -> &'static [ProtocolSpec] {
        PROTOCOLS
    }

    /// # Errors
    ///
    /// [`GateError::Framing`] for an unknown protocol.
    pub fn lookup(&self, id: &str) -> GateResult<&'static ProtocolSpec> {
        PROTOCOLS
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| GateError::framing(format!("unknown protocol '{id}'")))
    }

    /// Port to use when the client left it out. `0` (always denied) when the
    /// protocol has no default.
    pub fn resolve_port(&self, spec: &ProtocolSpec, requested: Option<u16>) -> u16 {
        requested
            .or_else(|| self.port_overrides.get(spec.id).copied())
            .or(spec.default_port)
            .unwrap_or(0)
    }
}
