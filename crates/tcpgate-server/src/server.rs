//! Core server: accepts client channels and hands each one to the
//! dispatcher.
//!
//! Owns the shared read-only configuration, the dispatcher, and the
//! admission semaphore that caps concurrent sessions. Coordinates the
//! lifecycle of all incoming connections under one root cancellation token.

use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::transport::websocket::{self, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use tcpgate_core::{send_response, ClientSink, GateError, GateResult, Response};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The tcpgate server instance.
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    dispatcher: Arc<Dispatcher>,
    /// One permit per live client connection.
    sessions: Arc<Semaphore>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        Self {
            dispatcher: Arc::new(Dispatcher::new(config.clone())),
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            config,
        }
    }

    /// Listen until `shutdown` fires, then wait (bounded by the drain grace)
    /// for live sessions to wind down.
    pub async fn run(
        self,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        shutdown: CancellationToken,
    ) -> GateResult<()> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let acceptor = tls_config.map(TlsAcceptor::from);
        let tls = acceptor.is_some();
        let (local_addr, rx) = websocket::start_listener(
            addr,
            acceptor,
            websocket::ws_config(self.config.limits.max_message_hard_cap),
            shutdown.clone(),
        )
        .await?;

        info!(
            addr = %local_addr,
            tls,
            max_sessions = self.config.max_sessions,
            "tcpgate ready"
        );

        self.accept_loop(rx, &shutdown).await;
        self.drain().await;
        Ok(())
    }

    async fn accept_loop(
        &self,
        mut rx: mpsc::Receiver<WebSocketConnection>,
        shutdown: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
                conn = rx.recv() => match conn {
                    Some(conn) => self.spawn_connection(conn, shutdown.child_token()),
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, conn: WebSocketConnection, cancel: CancellationToken) {
        let remote = conn.remote_addr;
        let (mut source, mut sink) = conn.split();

        let permit = match self.sessions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(remote = %remote, limit = self.config.max_sessions, "session limit reached");
                tokio::spawn(async move {
                    let err = GateError::internal("session limit reached");
                    let _ = send_response(&mut sink, &Response::from_error(&err)).await;
                    let _ = sink.close().await;
                });
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            debug!(remote = %remote, "client connected");
            dispatcher.serve(&mut source, &mut sink, cancel).await;
            debug!(remote = %remote, "client disconnected");
            drop(permit);
        });
    }

    /// Wait for every admitted connection to release its permit.
    async fn drain(&self) {
        let total = u32::try_from(self.config.max_sessions).unwrap_or(u32::MAX);
        let grace = self.config.timeouts.drain_grace * 2;
        match tokio::time::timeout(grace, self.sessions.acquire_many(total)).await {
            Ok(_) => info!("all sessions closed"),
            Err(_) => warn!(
                open = self.config.max_sessions - self.sessions.available_permits(),
                "sessions still open after drain grace"
            ),
        }
    }
}
