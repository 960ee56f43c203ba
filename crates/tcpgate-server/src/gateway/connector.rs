//! Connection manager: opens and owns the backend TCP socket of a session.
//!
//! [`open`] only accepts an [`AllowedDestination`], so a socket can never be
//! opened for a destination that skipped validation. It makes exactly one
//! connection attempt, to the first validated address, under its own
//! deadline.

use super::policy::AllowedDestination;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tcpgate_core::{Destination, GateError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connect to {addr} timed out after {}ms", timeout.as_millis())]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("connect to {addr} refused: {reason}")]
    Refused { addr: SocketAddr, reason: String },

    #[error("connect to {addr} failed: unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    #[error("resolution failed: {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },
}

impl From<ConnectError> for GateError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Timeout { addr, timeout } => GateError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            },
            ConnectError::Refused { addr, reason } => GateError::ConnectRefused {
                addr: addr.to_string(),
                reason,
            },
            ConnectError::Unreachable { addr, reason } => GateError::ConnectRefused {
                addr: addr.to_string(),
                reason: format!("unreachable: {reason}"),
            },
            ConnectError::ResolutionFailed { host, reason } => {
                GateError::ResolutionFailed(format!("{host}: {reason}"))
            }
        }
    }
}

/// Open a TCP connection to a validated destination.
///
/// # Errors
///
/// A [`ConnectError`] distinguishing timeout, refusal, an unreachable
/// network, and an address the socket layer could not use.
pub async fn open(
    allowed: &AllowedDestination,
    connect_timeout: Duration,
) -> Result<BackendConnection, ConnectError> {
    let destination = allowed.destination().clone();
    let Some(&addr) = allowed.addrs().first() else {
        return Err(ConnectError::ResolutionFailed {
            host: destination.host,
            reason: "no validated address".to_string(),
        });
    };

    debug!(dest = %destination, addr = %addr, "connecting to backend");
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(dest = %destination, addr = %addr, error = %e, "backend connect failed");
            return Err(classify(&destination, addr, connect_timeout, e));
        }
        Err(_) => {
            warn!(dest = %destination, addr = %addr, timeout_ms = connect_timeout.as_millis() as u64, "backend connect timed out");
            return Err(ConnectError::Timeout {
                addr,
                timeout: connect_timeout,
            });
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "could not set TCP_NODELAY");
    }

    info!(dest = %destination, addr = %addr, "backend connected");
    Ok(BackendConnection {
        stream,
        peer: addr,
        destination,
        closed: false,
    })
}

fn classify(
    destination: &Destination,
    addr: SocketAddr,
    timeout: Duration,
    e: io::Error,
) -> ConnectError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ConnectError::Refused {
            addr,
            reason: e.to_string(),
        },
        io::ErrorKind::TimedOut => ConnectError::Timeout { addr, timeout },
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            ConnectError::ResolutionFailed {
                host: destination.host.clone(),
                reason: e.to_string(),
            }
        }
        _ => ConnectError::Unreachable {
            addr,
            reason: e.to_string(),
        },
    }
}

/// The backend socket of one session.
///
/// The session owns it exclusively; the bridge only borrows its halves.
/// [`BackendConnection::close`] is idempotent, and dropping the connection
/// releases the socket on every other exit path.
#[derive(Debug)]
pub struct BackendConnection {
    stream: TcpStream,
    peer: SocketAddr,
    destination: Destination,
    closed: bool,
}

impl BackendConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Borrow the read and write halves.
    pub fn split(&mut self) -> (ReadHalf<'_>, WriteHalf<'_>) {
        self.stream.split()
    }

    /// Shut down the write side and mark the connection closed.
    ///
    /// Returns `true` if this call performed the close, `false` if the
    /// connection had already been closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "backend shutdown failed");
        }
        debug!(peer = %self.peer, "backend connection closed");
        true
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        if !self.closed {
            debug!(peer = %self.peer, "backend connection released on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::policy::{DestinationValidator, GatewayPolicy};
    use crate::gateway::resolver::DnsResolver;
    use tcpgate_core::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn allow(host: &str, port: u16) -> AllowedDestination {
        let validator = DestinationValidator::new(
            GatewayPolicy {
                deny_ranges: Vec::new(),
                ..GatewayPolicy::default()
            },
            DnsResolver::new(Duration::from_secs(5)),
        );
        validator.validate(host, port).await.into_result().unwrap()
    }

    #[tokio::test]
    async fn test_open_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let allowed = allow("127.0.0.1", port).await;
        let mut conn = open(&allowed, Duration::from_secs(2)).await.unwrap();
        assert_eq!(conn.peer().port(), port);
        {
            let (mut r, mut w) = conn.split();
            w.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            r.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        }
        assert!(conn.close().await);
    }

    #[tokio::test]
    async fn test_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let allowed = allow("127.0.0.1", port).await;
        let err = open(&allowed, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused { .. }), "got {err:?}");
        assert_eq!(GateError::from(err).kind(), ErrorKind::ConnectRefused);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut rest = Vec::new();
            sock.read_to_end(&mut rest).await.unwrap();
            rest.len()
        });

        let allowed = allow("127.0.0.1", port).await;
        let mut conn = open(&allowed, Duration::from_secs(2)).await.unwrap();
        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.is_closed());
        // The peer sees exactly one clean EOF.
        assert_eq!(accept.await.unwrap(), 0);
    }

    #[test]
    fn test_timeout_maps_to_connect_timeout() {
        let err = ConnectError::Timeout {
            addr: "93.184.216.34:80".parse().unwrap(),
            timeout: Duration::from_millis(2500),
        };
        let gate: GateError = err.into();
        assert_eq!(gate.kind(), ErrorKind::ConnectTimeout);
        assert!(gate.sanitized_message().contains("93.184.216.34:80"));
    }

    #[test]
    fn test_connect_error_display_matches_gate_error() {
        let err = ConnectError::Refused {
            addr: "127.0.0.1:7".parse().unwrap(),
            reason: "Connection refused".into(),
        };
        let shown = err.to_string();
        assert_eq!(shown, "connect to 127.0.0.1:7 refused: Connection refused");
        assert_eq!(GateError::from(err).to_string(), shown);
    }
}
