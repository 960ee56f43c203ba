//! Request dispatcher: turns a client's first message into either a
//! one-shot exchange or an interactive bridged session.
//!
//! # Pipeline
//!
//! ```text
//! ClientRequest
//!   → Registry::lookup (unknown protocol / operation ⇒ ProtocolFraming)
//!   → DestinationValidator::validate (Deny ⇒ no socket is ever opened)
//!   → connector::open
//!   → codec negotiation (POP3 greeting, Redis AUTH, ...)
//!   → exchange: encode, write once, read until one frame
//!     interactive: open envelope, Bridge::run, terminal envelope
//! ```
//!
//! Every path ends with the backend closed, the session walked to
//! `Closed`, and exactly one terminal envelope written to the client.

use crate::config::GatewayConfig;
use crate::gateway::bridge::{Bridge, BridgeConfig, BridgeMode, READ_CHUNK};
use crate::gateway::connector::{self, BackendConnection};
use crate::gateway::policy::DestinationValidator;
use crate::gateway::DnsResolver;
use crate::registry::{ProtocolSpec, Registry};
use crate::session::{Session, SessionState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tcpgate_core::{
    send_response, AccumulationBuffer, Advance, ChannelMessage, ClientRequest, ClientSink,
    ClientSource, Codec, Credentials, DecodeResult, DestinationSpec, ErrorKind, GateError,
    GateResult, Operation, Response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes client requests through validation, connection and the codec.
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    validator: DestinationValidator,
    registry: Registry,
}

impl Dispatcher {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let validator = DestinationValidator::new(
            config.policy.clone(),
            DnsResolver::new(config.timeouts.resolve),
        );
        let registry = Registry::new(config.default_ports.clone());
        Self {
            config,
            validator,
            registry,
        }
    }

    /// Serve one client channel from its first message to its close.
    pub async fn serve(
        &self,
        source: &mut dyn ClientSource,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) {
        let first = tokio::select! {
            _ = cancel.cancelled() => None,
            first = tokio::time::timeout(self.config.timeouts.handshake, source.recv()) => Some(first),
        };
        let text = match first {
            None => {
                close_sink(sink).await;
                return;
            }
            Some(Err(_)) => {
                debug!("client sent no request before the handshake timeout");
                close_sink(sink).await;
                return;
            }
            Some(Ok(Ok(None))) => return,
            Some(Ok(Err(e))) => {
                debug!(error = %e, "client channel failed before the first request");
                reply_and_close(sink, &Response::from_error(&e)).await;
                return;
            }
            Some(Ok(Ok(Some(ChannelMessage::Text(text))))) => text,
            Some(Ok(Ok(Some(ChannelMessage::Binary(bytes))))) => {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };

        let request: ClientRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let err = GateError::from(e);
                debug!(error = %err, "malformed first message");
                reply_and_close(sink, &Response::from_error(&err)).await;
                return;
            }
        };

        match request {
            ClientRequest::Exchange {
                destination,
                protocol,
                operation,
            } => {
                let response = tokio::select! {
                    response = self.exchange(&destination, &protocol, &operation) => response,
                    _ = cancel.cancelled() => {
                        Response::from_error(&GateError::internal("gateway shutting down"))
                    }
                };
                reply_and_close(sink, &response).await;
            }
            ClientRequest::Open {
                destination,
                protocol,
                auth,
            } => {
                self.interactive(&destination, &protocol, auth.as_ref(), source, sink, cancel)
                    .await;
            }
        }
    }

    /// One request, one response.
    pub async fn exchange(
        &self,
        destination: &DestinationSpec,
        protocol: &str,
        op: &Operation,
    ) -> Response {
        let spec = match self.exchange_target(protocol, op) {
            Ok(spec) => spec,
            Err(e) => return Response::from_error(&e),
        };
        let mut session = Session::new(spec.id);
        let result = self.run_exchange(&mut session, spec, destination, op).await;
        session.finish();
        match result {
            Ok(rendered) => Response::ok(rendered),
            Err(e) => {
                report(session.id(), &e);
                Response::from_error(&e)
            }
        }
    }

    fn exchange_target(&self, protocol: &str, op: &Operation) -> GateResult<&'static ProtocolSpec> {
        let spec = self.registry.lookup(protocol)?;
        if !spec.supports_exchange(&op.operation) {
            return Err(GateError::framing(format!(
                "protocol '{}' does not support operation '{}'",
                spec.id, op.operation
            )));
        }
        Ok(spec)
    }

    async fn run_exchange(
        &self,
        session: &mut Session,
        spec: &'static ProtocolSpec,
        destination: &DestinationSpec,
        op: &Operation,
    ) -> GateResult<serde_json::Value> {
        let mut codec = spec
            .codec(self.config.codec_limits())
            .ok_or_else(|| GateError::internal(format!("protocol '{}' has no codec", spec.id)))?;
        let mut backend = self.connect(session, spec, destination).await?;
        let mut buffer = AccumulationBuffer::new(self.config.session_buffer_size());

        let result = async {
            negotiate(
                codec.as_mut(),
                &mut buffer,
                &mut backend,
                None,
                self.config.timeouts.handshake,
            )
            .await?;
            session.transition(SessionState::Active)?;

            let request = codec.encode_request(op)?;
            if !request.is_empty() {
                let (_, mut writer) = backend.split();
                writer.write_all(&request).await?;
            }
            let frame = read_one_frame(
                codec.as_mut(),
                &mut buffer,
                &mut backend,
                self.config.timeouts.idle,
            )
            .await?;
            codec.render(&frame)
        }
        .await;

        backend.close().await;
        result
    }

    /// Interactive session: negotiate, announce, bridge, report.
    async fn interactive(
        &self,
        destination: &DestinationSpec,
        protocol: &str,
        auth: Option<&Credentials>,
        source: &mut dyn ClientSource,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) {
        let spec = match self.registry.lookup(protocol) {
            Ok(spec) => spec,
            Err(e) => {
                reply_and_close(sink, &Response::from_error(&e)).await;
                return;
            }
        };
        let mut session = Session::new(spec.id);

        let prepared = tokio::select! {
            prepared = self.prepare_interactive(&mut session, spec, destination, auth) => prepared,
            _ = cancel.cancelled() => Err(GateError::internal("gateway shutting down")),
        };
        let (mut backend, mode) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                session.finish();
                report(session.id(), &e);
                reply_and_close(sink, &Response::from_error(&e)).await;
                return;
            }
        };

        let opened = Response::ok(json!({
            "session_id": session.id(),
            "protocol": spec.id,
            "peer": backend.peer().to_string(),
        }));
        if let Err(e) = send_response(sink, &opened).await {
            debug!(session_id = %session.id(), error = %e, "client left before the session opened");
            backend.close().await;
            session.finish();
            return;
        }
        info!(
            session_id = %session.id(),
            protocol = spec.id,
            destination = %backend.destination(),
            peer = %backend.peer(),
            "session opened"
        );

        let bridge = Bridge::new(self.bridge_config());
        let outcome = bridge
            .run(source, sink, &mut backend, mode, cancel.child_token())
            .await;

        backend.close().await;
        session.finish();
        if let Some(err) = outcome.error() {
            report(session.id(), &err);
        }
        reply_and_close(sink, &outcome.to_response()).await;
    }

    async fn prepare_interactive(
        &self,
        session: &mut Session,
        spec: &'static ProtocolSpec,
        destination: &DestinationSpec,
        auth: Option<&Credentials>,
    ) -> GateResult<(BackendConnection, BridgeMode)> {
        let codec = if spec.interactive_is_raw() {
            None
        } else {
            Some(spec.codec(self.config.codec_limits()).ok_or_else(|| {
                GateError::internal(format!("protocol '{}' has no codec", spec.id))
            })?)
        };
        let mut backend = self.connect(session, spec, destination).await?;

        let mode = match codec {
            None => BridgeMode::Raw,
            Some(mut codec) => {
                let mut buffer = AccumulationBuffer::new(self.config.session_buffer_size());
                let negotiated = negotiate(
                    codec.as_mut(),
                    &mut buffer,
                    &mut backend,
                    auth,
                    self.config.timeouts.handshake,
                )
                .await;
                if let Err(e) = negotiated {
                    backend.close().await;
                    return Err(e);
                }
                BridgeMode::Structured { codec, buffer }
            }
        };
        session.transition(SessionState::Active)?;
        Ok((backend, mode))
    }

    /// Validate and connect, advancing the session through
    /// `Validating → Connecting`.
    async fn connect(
        &self,
        session: &mut Session,
        spec: &ProtocolSpec,
        destination: &DestinationSpec,
    ) -> GateResult<BackendConnection> {
        let port = self.registry.resolve_port(spec, destination.port);
        session.transition(SessionState::Validating)?;
        let allowed = self
            .validator
            .validate(&destination.host, port)
            .await
            .into_result()?;
        session.set_destination(allowed.destination().clone());
        session.transition(SessionState::Connecting)?;

        connector::open(&allowed, self.config.timeouts.connect)
            .await
            .map_err(|e| {
                warn!(
                    session_id = %session.id(),
                    destination = %allowed.destination(),
                    error = %e,
                    "backend connect failed"
                );
                GateError::from(e)
            })
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            idle_timeout: self.config.timeouts.idle,
            drain_grace: self.config.timeouts.drain_grace,
            max_message_size: self.config.limits.max_message_size,
            max_message_hard_cap: self.config.limits.max_message_hard_cap,
            high_water: self.config.backpressure.high_water,
            low_water: self.config.backpressure.low_water,
        }
    }
}

/// Drive the codec's negotiation until it reports ready.
///
/// Frames decoded after the codec becomes ready stay in `buffer` for the
/// caller.
async fn negotiate(
    codec: &mut dyn Codec,
    buffer: &mut AccumulationBuffer,
    backend: &mut BackendConnection,
    auth: Option<&Credentials>,
    limit: Duration,
) -> GateResult<()> {
    let opening = codec.start(auth)?;
    let protocol = codec.protocol();
    let (mut reader, mut writer) = backend.split();
    if !opening.is_empty() {
        writer.write_all(&opening).await?;
    }

    let negotiation = async {
        let mut chunk = vec![0u8; READ_CHUNK];
        while !codec.is_ready() {
            match codec.try_decode_frame(buffer) {
                DecodeResult::Frame(frame) => match codec.advance(frame)? {
                    Advance::Reply(bytes) if bytes.is_empty() => {}
                    Advance::Reply(bytes) => writer.write_all(&bytes).await?,
                    Advance::Deliver(_) => {
                        return Err(GateError::handshake("unexpected frame during negotiation"))
                    }
                },
                DecodeResult::Invalid(reason) => return Err(GateError::framing(reason)),
                DecodeResult::NeedMoreData => {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(GateError::handshake("backend closed during negotiation"));
                    }
                    buffer.extend(&chunk[..n])?;
                }
            }
        }
        Ok::<(), GateError>(())
    };

    match tokio::time::timeout(limit, negotiation).await {
        Ok(result) => {
            if result.is_ok() {
                debug!(protocol, "backend negotiation finished");
            }
            result
        }
        Err(_) => Err(GateError::handshake(format!(
            "negotiation did not finish within {}ms",
            limit.as_millis()
        ))),
    }
}

/// Read until the codec delivers one frame. Negotiation replies that show
/// up on the way are written back to the backend.
async fn read_one_frame(
    codec: &mut dyn Codec,
    buffer: &mut AccumulationBuffer,
    backend: &mut BackendConnection,
    idle: Duration,
) -> GateResult<tcpgate_core::Frame> {
    let (mut reader, mut writer) = backend.split();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let decoded = codec.try_decode_frame(buffer);
        let frame = match decoded {
            DecodeResult::Frame(frame) => frame,
            DecodeResult::Invalid(reason) => return Err(GateError::framing(reason)),
            DecodeResult::NeedMoreData => {
                let n = tokio::time::timeout(idle, reader.read(&mut chunk))
                    .await
                    .map_err(|_| GateError::IdleTimeout { idle })??;
                if n > 0 {
                    buffer.extend(&chunk[..n])?;
                    continue;
                }
                match codec.try_decode_eof(buffer) {
                    DecodeResult::Frame(frame) => frame,
                    DecodeResult::Invalid(reason) => return Err(GateError::framing(reason)),
                    DecodeResult::NeedMoreData => {
                        return Err(GateError::framing("backend closed before responding"))
                    }
                }
            }
        };
        match codec.advance(frame)? {
            Advance::Deliver(frame) => return Ok(frame),
            Advance::Reply(bytes) if bytes.is_empty() => {}
            Advance::Reply(bytes) => writer.write_all(&bytes).await?,
        }
    }
}

/// Log an error with the detail it deserves; `Internal` detail stays here.
fn report(session_id: &str, err: &GateError) {
    match err.kind() {
        ErrorKind::Internal => error!(session_id, error = %err, "internal error"),
        ErrorKind::ValidationDenied | ErrorKind::ConnectRefused | ErrorKind::ConnectTimeout => {
            warn!(session_id, kind = err.kind().as_str(), error = %err, "session refused")
        }
        kind => debug!(session_id, kind = kind.as_str(), error = %err, "session failed"),
    }
}

async fn reply_and_close(sink: &mut dyn ClientSink, response: &Response) {
    if let Err(e) = send_response(sink, response).await {
        debug!(error = %e, "could not deliver final envelope");
    }
    close_sink(sink).await;
}

async fn close_sink(sink: &mut dyn ClientSink) {
    if let Err(e) = sink.close().await {
        debug!(error = %e, "client channel close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayPolicy;
    use crate::transport::memory;
    use tcpgate_core::codec::length::record_encode;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn loopback_config() -> GatewayConfig {
        GatewayConfig {
            policy: GatewayPolicy {
                deny_ranges: Vec::new(),
                ..GatewayPolicy::default()
            },
            ..GatewayConfig::default()
        }
    }

    fn dispatcher(config: GatewayConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(config))
    }

    fn to(port: u16) -> DestinationSpec {
        DestinationSpec {
            host: "127.0.0.1".into(),
            port: Some(port),
        }
    }

    /// Accept one connection and hand it to `handler`.
    async fn backend<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handler(stream).await;
        });
        port
    }

    async fn echo_backend() -> u16 {
        backend(|mut stream| async move {
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        })
        .await
    }

    fn kind(response: &Response) -> ErrorKind {
        response.error.as_ref().map(|e| e.kind).unwrap()
    }

    #[tokio::test]
    async fn test_echo_exchange() {
        let port = echo_backend().await;
        let op = Operation::new("send").with_param("data", "hello gateway");
        let resp = dispatcher(loopback_config()).exchange(&to(port), "echo", &op).await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(resp.result, Some(json!({"line": "hello gateway"})));
    }

    #[tokio::test]
    async fn test_records_exchange() {
        let port = echo_backend().await;
        let record = json!({"id": 7, "tags": ["x", "y"]});
        let op = Operation::new("send").with_param("record", record.clone());
        let resp = dispatcher(loopback_config()).exchange(&to(port), "records", &op).await;
        assert_eq!(resp.result, Some(json!({"record": record})));
    }

    #[tokio::test]
    async fn test_finger_reads_until_close() {
        let port = backend(|mut stream| async move {
            let mut query = [0u8; 64];
            let _ = stream.read(&mut query).await;
            stream.write_all(b"Login: alice\r\nNo Plan.\r\n").await.unwrap();
        })
        .await;
        let op = Operation::new("query").with_param("user", "alice");
        let resp = dispatcher(loopback_config()).exchange(&to(port), "finger", &op).await;
        assert_eq!(resp.result.unwrap()["lines"], json!(["Login: alice", "No Plan."]));
    }

    #[tokio::test]
    async fn test_pop3_exchange_negotiates_first() {
        let port = backend(|mut stream| async move {
            let (r, mut w) = stream.split();
            let mut lines = tokio::io::BufReader::new(r);
            w.write_all(b"+OK POP3 ready\r\n").await.unwrap();
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CAPA\r\n");
            w.write_all(b"+OK\r\nUSER\r\n.\r\n").await.unwrap();
            line.clear();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "STAT\r\n");
            w.write_all(b"+OK 2 320\r\n").await.unwrap();
        })
        .await;
        let resp = dispatcher(loopback_config())
            .exchange(&to(port), "pop3", &Operation::new("stat"))
            .await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(resp.result.unwrap()["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_pop3_greeting_rejected() {
        let port = backend(|mut stream| async move {
            stream.write_all(b"-ERR go away\r\n").await.unwrap();
        })
        .await;
        let resp = dispatcher(loopback_config())
            .exchange(&to(port), "pop3", &Operation::new("stat"))
            .await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolHandshake);
        assert!(resp.error.unwrap().message.contains("go away"));
    }

    #[tokio::test]
    async fn test_metadata_address_denied() {
        let d = dispatcher(GatewayConfig::default());
        let dest = DestinationSpec {
            host: "169.254.169.254".into(),
            port: Some(80),
        };
        let op = Operation::new("send").with_param("data", "x");
        let resp = d.exchange(&dest, "echo", &op).await;
        assert!(!resp.success);
        assert_eq!(kind(&resp), ErrorKind::ValidationDenied);
    }

    #[tokio::test]
    async fn test_unknown_protocol_and_operation() {
        let d = dispatcher(loopback_config());
        let resp = d.exchange(&to(1), "gopher", &Operation::new("get")).await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolFraming);
        let resp = d.exchange(&to(1), "redis", &Operation::new("subscribe")).await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolFraming);
        let resp = d.exchange(&to(1), "tcp", &Operation::new("send")).await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolFraming);
    }

    #[tokio::test]
    async fn test_missing_port_without_default_is_denied() {
        let d = dispatcher(loopback_config());
        let dest = DestinationSpec {
            host: "127.0.0.1".into(),
            port: None,
        };
        let op = Operation::new("send").with_param("record", json!(1));
        let resp = d.exchange(&dest, "records", &op).await;
        assert_eq!(kind(&resp), ErrorKind::ValidationDenied);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let op = Operation::new("send").with_param("data", "x");
        let resp = dispatcher(loopback_config()).exchange(&to(port), "echo", &op).await;
        assert_eq!(kind(&resp), ErrorKind::ConnectRefused);
    }

    #[tokio::test]
    async fn test_truncated_record_is_framing_error() {
        let port = backend(|mut stream| async move {
            let mut req = [0u8; 64];
            let _ = stream.read(&mut req).await;
            let wire = record_encode(&json!("abcdef"), 1024).unwrap();
            stream.write_all(&wire[..wire.len() - 2]).await.unwrap();
        })
        .await;
        let op = Operation::new("send").with_param("record", json!("q"));
        let resp = dispatcher(loopback_config()).exchange(&to(port), "records", &op).await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolFraming);
    }

    #[tokio::test]
    async fn test_record_at_frame_cap_decodes() {
        const CAP: usize = 64 * 1024;
        let port = backend(|mut stream| async move {
            let mut req = [0u8; 64];
            let _ = stream.read(&mut req).await;
            let mut wire = (CAP as u32).to_be_bytes().to_vec();
            wire.extend(std::iter::repeat(0xffu8).take(CAP));
            stream.write_all(&wire).await.unwrap();
            let _ = stream.read(&mut req).await;
        })
        .await;
        let mut config = loopback_config();
        config.limits.max_frame_size = CAP;
        config.limits.max_buffer_size = CAP;
        let op = Operation::new("send").with_param("record", json!("q"));
        let resp = dispatcher(config).exchange(&to(port), "records", &op).await;
        assert!(resp.success, "{resp:?}");
    }

    #[tokio::test]
    async fn test_serve_raw_session() {
        let port = echo_backend().await;
        let d = dispatcher(loopback_config());
        let (mut source, mut sink, mut client) = memory::pair(16);

        let serve = d.serve(&mut source, &mut sink, CancellationToken::new());
        let drive = async move {
            client
                .send_text(json!({"type": "open", "protocol": "tcp", "destination": {"host": "127.0.0.1", "port": port}}).to_string())
                .await;
            let opened = client.recv_response().await;
            assert!(opened.success);
            let result = opened.result.unwrap();
            assert_eq!(result["protocol"], json!("tcp"));
            assert_eq!(result["session_id"].as_str().unwrap().len(), 32);

            client.send_binary(b"ping".to_vec()).await;
            let mut echoed = Vec::new();
            while echoed.len() < 4 {
                match client.recv().await {
                    Some(ChannelMessage::Binary(b)) => echoed.extend(b),
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(echoed, b"ping");

            let memory::ClientEnd { tx, mut rx } = client;
            drop(tx);
            let closed = match rx.recv().await {
                Some(ChannelMessage::Text(t)) => serde_json::from_str::<Response>(&t).unwrap(),
                other => panic!("expected final envelope, got {other:?}"),
            };
            assert_eq!(closed.result, Some(json!({"closed": "client_closed"})));
            assert!(rx.recv().await.is_none());
        };
        tokio::join!(serve, drive);
    }

    #[tokio::test]
    async fn test_serve_structured_redis_session() {
        let port = backend(|mut stream| async move {
            let mut req = [0u8; 256];
            let n = stream.read(&mut req).await.unwrap();
            assert_eq!(&req[..n], b"*1\r\n$4\r\nPING\r\n");
            stream.write_all(b"+PONG\r\n").await.unwrap();
            let _ = stream.read(&mut req).await;
        })
        .await;
        let d = dispatcher(loopback_config());
        let (mut source, mut sink, mut client) = memory::pair(16);

        let serve = d.serve(&mut source, &mut sink, CancellationToken::new());
        let drive = async move {
            client
                .send_text(json!({"type": "open", "protocol": "redis", "destination": {"host": "127.0.0.1", "port": port}}).to_string())
                .await;
            assert!(client.recv_response().await.success);
            client.send_text(r#"{"operation":"ping"}"#).await;
            let pong = client.recv_response().await;
            assert!(pong.success, "{pong:?}");
            assert_eq!(pong.result.unwrap()["value"], json!("PONG"));
            drop(client);
        };
        tokio::join!(serve, drive);
    }

    #[tokio::test]
    async fn test_serve_idle_session_times_out() {
        let port = echo_backend().await;
        let mut config = loopback_config();
        config.timeouts.idle = Duration::from_millis(150);
        let d = dispatcher(config);
        let (mut source, mut sink, mut client) = memory::pair(16);

        let serve = d.serve(&mut source, &mut sink, CancellationToken::new());
        let drive = async move {
            client
                .send_text(json!({"type": "open", "protocol": "tcp", "destination": {"host": "127.0.0.1", "port": port}}).to_string())
                .await;
            assert!(client.recv_response().await.success);
            let last = client.recv_response().await;
            assert_eq!(kind(&last), ErrorKind::IdleTimeout);
            assert!(client.recv().await.is_none());
        };
        tokio::join!(serve, drive);
    }

    #[tokio::test]
    async fn test_serve_malformed_first_message() {
        let d = dispatcher(loopback_config());
        let (mut source, mut sink, mut client) = memory::pair(4);
        client.send_text(r#"{"type":"teleport"}"#).await;
        d.serve(&mut source, &mut sink, CancellationToken::new()).await;
        let resp = client.recv_response().await;
        assert_eq!(kind(&resp), ErrorKind::ProtocolFraming);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_serve_denied_open_never_connects() {
        let d = dispatcher(GatewayConfig::default());
        let (mut source, mut sink, mut client) = memory::pair(4);
        client
            .send_text(r#"{"type":"open","protocol":"tcp","destination":{"host":"10.0.0.1","port":22}}"#)
            .await;
        d.serve(&mut source, &mut sink, CancellationToken::new()).await;
        let resp = client.recv_response().await;
        assert_eq!(kind(&resp), ErrorKind::ValidationDenied);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_session() {
        let port = echo_backend().await;
        let d = dispatcher(loopback_config());
        let (mut source, mut sink, mut client) = memory::pair(16);
        let root = CancellationToken::new();
        let trigger = root.clone();

        let serve = d.serve(&mut source, &mut sink, root.child_token());
        let drive = async move {
            client
                .send_text(json!({"type": "open", "protocol": "tcp", "destination": {"host": "127.0.0.1", "port": port}}).to_string())
                .await;
            assert!(client.recv_response().await.success);
            trigger.cancel();
            let last = client.recv_response().await;
            assert_eq!(last.result, Some(json!({"closed": "cancelled"})));
        };
        tokio::join!(serve, drive);
    }
}
