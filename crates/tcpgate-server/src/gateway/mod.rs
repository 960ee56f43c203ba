//! Gateway module: everything between an accepted request and the backend
//! socket.
//!
//! # Submodule Architecture
//!
//! - **[`policy`]**: the [`GatewayPolicy`] deny/self ranges and the
//!   [`DestinationValidator`](policy::DestinationValidator) that turns a
//!   requested host and port into an
//!   [`AllowedDestination`](policy::AllowedDestination) or a denial. Nothing
//!   connects without passing through it.
//!
//! - **[`resolver`]**: the [`DnsResolver`], async name lookup via
//!   `tokio::net::lookup_host` under a timeout. Used only by the validator.
//!
//! - **[`connector`]**: one bounded connect attempt to the address the
//!   validator already checked, producing a
//!   [`BackendConnection`](connector::BackendConnection).
//!
//! - **[`backpressure`]**: the per-direction high/low-water credit gate.
//!
//! - **[`bridge`]**: the bidirectional pump for interactive sessions.
//!
//! # Data Flow
//!
//! ```text
//! Dispatcher
//!   → DestinationValidator::validate
//!       → DnsResolver::resolve (hostnames only)
//!   → connector::open (literal IP from the verdict)
//!   → Bridge::run
//!       → BackpressureGate::reserve per queued chunk
//! ```

pub mod backpressure;
pub mod bridge;
pub mod connector;
pub mod policy;
pub mod resolver;

pub use policy::GatewayPolicy;
pub use resolver::DnsResolver;
