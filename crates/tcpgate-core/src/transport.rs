//! Abstract client channel traits.
//!
//! The gateway speaks to its clients over a message-oriented channel
//! (WebSocket in production, an in-memory pair in tests). The two halves
//! are split so the inbound and outbound pumps of a session can own one
//! each.

use crate::error::GateResult;
use crate::messages::Response;
use std::future::Future;
use std::pin::Pin;

/// One message on a client channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the message; text is carried as its UTF-8 encoding.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.into_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// Inbound half of a client channel.
pub trait ClientSource: Send {
    /// Next message, or `None` once the client has closed.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<ChannelMessage>>> + Send + '_>>;
}

/// Outbound half of a client channel.
pub trait ClientSink: Send {
    fn send(
        &mut self,
        msg: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>>;

    /// Close the channel. Calling it more than once is harmless.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>>;
}

/// Serialize a response envelope and send it as a text message.
pub async fn send_response<S: ClientSink + ?Sized>(sink: &mut S, response: &Response) -> GateResult<()> {
    sink.send(ChannelMessage::Text(response.to_json())).await
}
