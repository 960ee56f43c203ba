//! Session lifecycle: identity, state machine and terminal outcome.
//!
//! ```text
//! Created → Validating → Connecting → Active  → Closing → Closed
//!                  ↘            ↘
//!                   Refused ──────────────────→ Closing
//! ```
//!
//! Every transition is logged at `debug`. An illegal transition is a bug in
//! the gateway and surfaces as [`GateError::Internal`], never as a panic.

use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use tcpgate_core::{Destination, GateError, GateResult, Response};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Validating,
    Connecting,
    Active,
    Refused,
    Closing,
    Closed,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Created, Refused)
                | (Validating, Connecting)
                | (Validating, Refused)
                | (Connecting, Active)
                | (Connecting, Refused)
                | (Active, Closing)
                | (Refused, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One end-to-end logical connection mediated by the gateway.
#[derive(Debug)]
pub struct Session {
    id: String,
    protocol: &'static str,
    destination: Option<Destination>,
    state: SessionState,
    created_at: Instant,
}

impl Session {
    pub fn new(protocol: &'static str) -> Self {
        let id = generate_session_id();
        debug!(session_id = %id, protocol, "session created");
        Self {
            id,
            protocol,
            destination: None,
            state: SessionState::Created,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn set_destination(&mut self, destination: Destination) {
        self.destination = Some(destination);
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// [`GateError::Internal`] if the lifecycle does not allow the move; the
    /// state is left unchanged.
    pub fn transition(&mut self, next: SessionState) -> GateResult<()> {
        if !self.state.can_move_to(next) {
            error!(session_id = %self.id, from = %self.state, to = %next, "illegal session transition");
            return Err(GateError::internal(format!(
                "illegal session transition {} -> {}",
                self.state, next
            )));
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Walk whatever is left of the lifecycle down to `Closed`.
    pub fn finish(&mut self) {
        let remaining: &[SessionState] = match self.state {
            SessionState::Closed => return,
            SessionState::Created | SessionState::Validating | SessionState::Connecting => &[
                SessionState::Refused,
                SessionState::Closing,
                SessionState::Closed,
            ],
            SessionState::Active | SessionState::Refused => {
                &[SessionState::Closing, SessionState::Closed]
            }
            SessionState::Closing => &[SessionState::Closed],
        };
        for &next in remaining {
            if let Err(e) = self.transition(next) {
                warn!(session_id = %self.id, error = %e, "session teardown step rejected");
            }
        }
        info!(
            session_id = %self.id,
            protocol = self.protocol,
            elapsed_ms = self.age().as_millis() as u64,
            "session closed"
        );
    }
}

/// How an interactive session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    ClientClosed,
    BackendClosed,
    IdleTimeout(Duration),
    MessageTooLarge { size: usize, limit: usize },
    ClientError(String),
    BackendError(String),
    ProtocolFraming(String),
    ProtocolHandshake(String),
    Cancelled,
}

impl SessionOutcome {
    /// The error behind a failed outcome; `None` for clean closes.
    pub fn error(&self) -> Option<GateError> {
        match self {
            Self::ClientClosed | Self::BackendClosed | Self::Cancelled => None,
            Self::IdleTimeout(idle) => Some(GateError::IdleTimeout { idle: *idle }),
            Self::MessageTooLarge { size, limit } => Some(GateError::MessageTooLarge {
                size: *size,
                limit: *limit,
            }),
            Self::ClientError(msg) => Some(GateError::internal(format!("client channel: {msg}"))),
            Self::BackendError(msg) => Some(GateError::internal(format!("backend socket: {msg}"))),
            Self::ProtocolFraming(msg) => Some(GateError::framing(msg.clone())),
            Self::ProtocolHandshake(msg) => Some(GateError::handshake(msg.clone())),
        }
    }

    /// Label used in `{"closed": ...}` envelopes and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::BackendClosed => "backend_closed",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::ClientError(_) => "client_error",
            Self::BackendError(_) => "backend_error",
            Self::ProtocolFraming(_) => "protocol_framing",
            Self::ProtocolHandshake(_) => "protocol_handshake",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal envelope sent before the client channel closes.
    pub fn to_response(&self) -> Response {
        match self.error() {
            Some(err) => Response::from_error(&err),
            None => Response::ok(json!({ "closed": self.label() })),
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
