//! Client-facing transports.
//!
//! [`websocket`] is the production front door. Tests drive the dispatcher
//! and bridge through the in-memory channel in `memory`.

#[cfg(test)]
pub mod memory;
pub mod websocket;
