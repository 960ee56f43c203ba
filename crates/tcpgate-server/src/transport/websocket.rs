//! WebSocket front door using tokio-tungstenite.
//!
//! The listener accepts TCP connections, optionally wraps them in TLS, runs
//! the WebSocket upgrade, and yields [`WebSocketConnection`]s on a channel.
//! Each connection is then split into a [`WsSource`] and a [`WsSink`], the
//! client-channel halves the dispatcher and bridge work with.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tcpgate_core::{ChannelMessage, ClientSink, ClientSource, GateError, GateResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on the TLS and WebSocket upgrade of one connection.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted socket, plain or TLS.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<ClientStream>,
    pub remote_addr: SocketAddr,
}

impl WebSocketConnection {
    /// Split into the client-channel halves.
    pub fn split(self) -> (WsSource, WsSink) {
        let (sink, stream) = self.ws_stream.split();
        (WsSource { stream }, WsSink { sink })
    }
}

/// WebSocket settings derived from the gateway's message limits.
pub fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop stops when `shutdown` fires or the
/// receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    config: WebSocketConfig,
    shutdown: CancellationToken,
) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr).await?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, tls = tls.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(UPGRADE_TIMEOUT, upgrade(stream, tls, config)).await {
                            Ok(Ok(ws_stream)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket accept loop stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    config: WebSocketConfig,
) -> GateResult<WebSocketStream<ClientStream>> {
    let _ = stream.set_nodelay(true);
    let stream = match tls {
        Some(acceptor) => ClientStream::Tls(Box::new(acceptor.accept(stream).await?)),
        None => ClientStream::Plain(stream),
    };
    tokio_tungstenite::accept_async_with_config(stream, Some(config))
        .await
        .map_err(map_ws_error)
}

fn map_ws_error(e: WsError) -> GateError {
    match e {
        WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
            GateError::MessageTooLarge {
                size,
                limit: max_size,
            }
        }
        WsError::Io(e) => GateError::Io(e),
        other => GateError::internal(format!("websocket: {other}")),
    }
}

/// Receiving half of a client WebSocket.
pub struct WsSource {
    stream: SplitStream<WebSocketStream<ClientStream>>,
}

impl ClientSource for WsSource {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<ChannelMessage>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Ok(Some(ChannelMessage::Text(text.to_string())))
                    }
                    Some(Ok(Message::Binary(data))) => {
                        return Ok(Some(ChannelMessage::Binary(data.to_vec())))
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                    Some(Err(e)) => return Err(map_ws_error(e)),
                }
            }
        })
    }
}

/// Sending half of a client WebSocket.
pub struct WsSink {
    sink: SplitSink<WebSocketStream<ClientStream>, Message>,
}

impl ClientSink for WsSink {
    fn send(
        &mut self,
        msg: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            let msg = match msg {
                ChannelMessage::Text(text) => Message::Text(text.into()),
                ChannelMessage::Binary(data) => Message::Binary(data.into()),
            };
            self.sink.send(msg).await.map_err(map_ws_error)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            match self.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(map_ws_error(e)),
            }
        })
    }
}
