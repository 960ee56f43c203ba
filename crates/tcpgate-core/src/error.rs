//! Error types and the caller-visible error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Message surfaced to callers in place of any `Internal` error detail.
pub const INTERNAL_MESSAGE: &str = "internal gateway error";

/// Caller-visible error taxonomy carried in `error.kind` of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationDenied,
    ResolutionFailed,
    ConnectTimeout,
    ConnectRefused,
    ProtocolFraming,
    ProtocolHandshake,
    MessageTooLarge,
    IdleTimeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationDenied => "ValidationDenied",
            Self::ResolutionFailed => "ResolutionFailed",
            Self::ConnectTimeout => "ConnectTimeout",
            Self::ConnectRefused => "ConnectRefused",
            Self::ProtocolFraming => "ProtocolFraming",
            Self::ProtocolHandshake => "ProtocolHandshake",
            Self::MessageTooLarge => "MessageTooLarge",
            Self::IdleTimeout => "IdleTimeout",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced anywhere in the gateway core.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("destination denied: {0}")]
    ValidationDenied(String),

    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("connect to {addr} timed out after {}ms", timeout.as_millis())]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connect to {addr} refused: {reason}")]
    ConnectRefused { addr: String, reason: String },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("no traffic for {}ms", idle.as_millis())]
    IdleTimeout { idle: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl GateError {
    /// Map onto the caller-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationDenied(_) => ErrorKind::ValidationDenied,
            Self::ResolutionFailed(_) => ErrorKind::ResolutionFailed,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ConnectRefused { .. } => ErrorKind::ConnectRefused,
            Self::Framing(_) => ErrorKind::ProtocolFraming,
            Self::Handshake(_) => ErrorKind::ProtocolHandshake,
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::IdleTimeout { .. } => ErrorKind::IdleTimeout,
            Self::Io(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a caller.
    ///
    /// `Internal` detail (including raw I/O errors from inside the gateway)
    /// is replaced with [`INTERNAL_MESSAGE`]; every other kind keeps its
    /// host/port, timeout, or backend-reported text.
    pub fn sanitized_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => INTERNAL_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GateError::Framing(format!("invalid CBOR record: {e}"))
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GateError::Internal(format!("CBOR encode failed: {e}"))
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Framing(format!("invalid JSON message: {e}"))
    }
}

pub type GateResult<T> = Result<T, GateError>;
