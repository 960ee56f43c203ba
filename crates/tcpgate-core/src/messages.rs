//! Client-facing message types and the uniform response envelope.
//!
//! The first message a client sends on a fresh channel is a JSON
//! [`ClientRequest`]. Every reply, whether a one-shot result, a decoded
//! frame during an interactive session, or a terminal error, is a
//! [`Response`] envelope:
//!
//! ```text
//! { "success": bool, "result"?: <payload>, "error"?: { "kind", "message" } }
//! ```

use crate::error::{ErrorKind, GateError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Host and port a session wants to reach on the backend network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Destination as supplied by a client; the port may be left to the
/// protocol's default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSpec {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Credentials passed through untouched to backends that authenticate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A named protocol operation with free-form parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Operation {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Fetch a required string parameter.
    pub fn str_param(&self, key: &str) -> Result<&str, GateError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GateError::framing(format!(
                    "operation '{}' requires string parameter '{key}'",
                    self.operation
                ))
            })
    }

    /// Fetch an optional string parameter.
    pub fn opt_str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// First message on a client channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// One request, one response, then the channel closes.
    Exchange {
        destination: DestinationSpec,
        protocol: String,
        #[serde(flatten)]
        operation: Operation,
    },
    /// Long-lived interactive session.
    Open {
        destination: DestinationSpec,
        protocol: String,
        #[serde(default)]
        auth: Option<Credentials>,
    },
}

impl ClientRequest {
    pub fn protocol(&self) -> &str {
        match self {
            Self::Exchange { protocol, .. } | Self::Open { protocol, .. } => protocol,
        }
    }

    pub fn destination(&self) -> &DestinationSpec {
        match self {
            Self::Exchange { destination, .. } | Self::Open { destination, .. } => destination,
        }
    }
}

/// Error body of a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// The uniform response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Build a sanitized failure envelope from a gateway error.
    pub fn from_error(err: &GateError) -> Self {
        Self::failure(err.kind(), err.sanitized_message())
    }

    pub fn to_json(&self) -> String {
        // A Response holds only strings, bools and serde_json values, which
        // always serialize.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":{"kind":"Internal","message":"internal gateway error"}}"#
                .to_string()
        })
    }
}
