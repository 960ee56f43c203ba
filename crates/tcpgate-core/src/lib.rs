//! tcpgate-core: protocol library for the tcpgate gateway.
//!
//! Provides the error taxonomy and response envelope, client message types,
//! the bounded accumulation buffer, the codec framework with its wire
//! codecs, and abstract client channel traits.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use buffer::AccumulationBuffer;
pub use codec::{Advance, Codec, CodecLimits, DecodeResult, Frame};
pub use error::{ErrorKind, GateError, GateResult, INTERNAL_MESSAGE};
pub use messages::{ClientRequest, Credentials, Destination, DestinationSpec, Operation, Response};
pub use transport::{send_response, ChannelMessage, ClientSink, ClientSource};
