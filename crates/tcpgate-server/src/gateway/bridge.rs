//! Stream bridge: pumps one session's bytes between the client channel and
//! the backend socket.
//!
//! # Pumps
//!
//! Each direction is a reader feeding a writer through a bounded queue, and
//! every queued item carries a [`GatePermit`] from that direction's
//! [`BackpressureGate`]. The permit is dropped only after the writer has
//! flushed the item, so a slow consumer stalls the reader once the
//! high-water mark is reached.
//!
//! ```text
//! client ─► client_reader ─► [up queue] ─► backend_writer ─► backend
//! client ◄─ client_writer ◄─ [down queue] ◄─ backend_reader ◄─ backend
//! ```
//!
//! Raw sessions pass bytes through untouched. Structured sessions encode
//! client operations with the session's codec and render every decoded
//! backend frame as a response envelope.
//!
//! # Termination
//!
//! The first pump to finish records the [`SessionOutcome`] and cancels the
//! bridge's token; the others observe it at their next suspension point.
//! Writers then drain what is already queued for up to `drain_grace` and
//! discard the rest. An idle watchdog ends the session when neither side
//! has sent anything for `idle_timeout`.

use super::backpressure::{BackpressureGate, GatePermit};
use super::connector::BackendConnection;
use crate::session::SessionOutcome;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tcpgate_core::{
    AccumulationBuffer, Advance, ChannelMessage, ClientSink, ClientSource, Codec, DecodeResult,
    GateError, GateResult, Operation, Response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest single read from the backend socket.
pub const READ_CHUNK: usize = 16 * 1024;
const QUEUE_DEPTH: usize = 64;

/// Limits and timeouts for one bridge.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub idle_timeout: Duration,
    pub drain_grace: Duration,
    /// Client messages larger than this are split into several writes.
    pub max_message_size: usize,
    /// Client messages larger than this end the session.
    pub max_message_hard_cap: usize,
    pub high_water: usize,
    pub low_water: usize,
}

/// How the bridge treats the bytes it carries.
pub enum BridgeMode {
    Raw,
    /// `buffer` may already hold bytes left over from the handshake.
    Structured {
        codec: Box<dyn Codec>,
        buffer: AccumulationBuffer,
    },
}

type Outbound = (ChannelMessage, GatePermit);
type Inbound = (Vec<u8>, GatePermit);

/// What one batch of backend bytes turned into.
#[derive(Debug, PartialEq)]
enum Action {
    Deliver(ChannelMessage),
    Reply(Vec<u8>),
}

struct Shared {
    outcome: Mutex<Option<SessionOutcome>>,
    last_activity: Mutex<Instant>,
    stop: CancellationToken,
}

impl Shared {
    fn finish(&self, outcome: SessionOutcome) {
        {
            let mut slot = lock(&self.outcome);
            if slot.is_none() {
                debug!(outcome = outcome.label(), "bridge stopping");
                *slot = Some(outcome);
            }
        }
        self.stop.cancel();
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bidirectional pump for one session.
pub struct Bridge {
    cfg: BridgeConfig,
    up_gate: Arc<BackpressureGate>,
    down_gate: Arc<BackpressureGate>,
}

impl Bridge {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            up_gate: BackpressureGate::new(cfg.high_water, cfg.low_water),
            down_gate: BackpressureGate::new(cfg.high_water, cfg.low_water),
            cfg,
        }
    }

    /// Highest outstanding byte counts seen as `(client→backend, backend→client)`.
    pub fn peak_outstanding(&self) -> (usize, usize) {
        (self.up_gate.peak(), self.down_gate.peak())
    }

    /// Run until either side closes, errors, idles out, or `cancel` fires.
    ///
    /// Borrows both channel ends and the backend socket; closing them is the
    /// caller's job once this returns.
    pub async fn run(
        &self,
        source: &mut dyn ClientSource,
        sink: &mut dyn ClientSink,
        backend: &mut BackendConnection,
        mode: BridgeMode,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let cfg = self.cfg;
        let shared = Shared {
            outcome: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            stop: cancel.child_token(),
        };
        let stop = &shared.stop;

        let (codec, mut buffer) = match mode {
            BridgeMode::Raw => (None, None),
            BridgeMode::Structured { codec, buffer } => (Some(Mutex::new(codec)), Some(buffer)),
        };
        let codec = codec.as_ref();

        let (up_tx, mut up_rx) = mpsc::channel::<Inbound>(QUEUE_DEPTH);
        let (down_tx, mut down_rx) = mpsc::channel::<Outbound>(QUEUE_DEPTH);
        let (mut backend_r, mut backend_w) = backend.split();
        let up_gate = &self.up_gate;
        let down_gate = &self.down_gate;

        let client_reader = async {
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => return,
                    received = source.recv() => received,
                };
                let msg = match received {
                    Ok(Some(msg)) => msg,
                    Ok(None) => return shared.finish(SessionOutcome::ClientClosed),
                    Err(GateError::MessageTooLarge { size, limit }) => {
                        return shared.finish(SessionOutcome::MessageTooLarge { size, limit })
                    }
                    Err(e) => return shared.finish(SessionOutcome::ClientError(e.to_string())),
                };
                shared.touch();
                if msg.len() > cfg.max_message_hard_cap {
                    return shared.finish(SessionOutcome::MessageTooLarge {
                        size: msg.len(),
                        limit: cfg.max_message_hard_cap,
                    });
                }

                let bytes = match codec {
                    None => msg.into_bytes(),
                    Some(codec) => match encode_client_message(codec, msg) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(error = %e, "rejected client operation");
                            let reply = ChannelMessage::Text(Response::from_error(&e).to_json());
                            if !queue_down(&down_tx, down_gate, stop, reply).await {
                                return;
                            }
                            continue;
                        }
                    },
                };
                if !queue_up(&up_tx, up_gate, stop, &bytes, cfg.max_message_size).await {
                    return;
                }
            }
        };

        let backend_writer = async {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    item = up_rx.recv() => item,
                };
                let Some((chunk, permit)) = item else { break };
                let written = tokio::select! {
                    biased;
                    written = backend_w.write_all(&chunk) => written,
                    _ = stop.cancelled() => break,
                };
                if let Err(e) = written {
                    return shared.finish(SessionOutcome::BackendError(e.to_string()));
                }
                drop(permit);
            }
            up_rx.close();
            let drained = tokio::time::timeout(cfg.drain_grace, async {
                while let Some((chunk, _permit)) = up_rx.recv().await {
                    if backend_w.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                debug!("drain grace elapsed, discarding queued backend writes");
            }
        };

        let backend_reader = async {
            let mut chunk = vec![0u8; READ_CHUNK.min(cfg.high_water)];
            loop {
                let read = tokio::select! {
                    _ = stop.cancelled() => return,
                    read = backend_r.read(&mut chunk) => read,
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => return shared.finish(SessionOutcome::BackendError(e.to_string())),
                };
                let eof = n == 0;
                if !eof {
                    shared.touch();
                }

                let actions = match (codec, buffer.as_mut()) {
                    (Some(codec), Some(buffer)) => {
                        let mut codec = lock(codec);
                        process_backend_bytes(codec.as_mut(), buffer, &chunk[..n], eof)
                    }
                    _ if eof => Ok(Vec::new()),
                    _ => Ok(vec![Action::Deliver(ChannelMessage::Binary(chunk[..n].to_vec()))]),
                };
                let actions = match actions {
                    Ok(actions) => actions,
                    Err(e) => return shared.finish(outcome_for(e)),
                };
                for action in actions {
                    let queued = match action {
                        Action::Deliver(msg) => queue_down(&down_tx, down_gate, stop, msg).await,
                        Action::Reply(bytes) => {
                            queue_up(&up_tx, up_gate, stop, &bytes, cfg.max_message_size).await
                        }
                    };
                    if !queued {
                        return;
                    }
                }
                if eof {
                    return shared.finish(SessionOutcome::BackendClosed);
                }
            }
        };

        let client_writer = async {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    item = down_rx.recv() => item,
                };
                let Some((msg, permit)) = item else { break };
                let sent = tokio::select! {
                    biased;
                    sent = sink.send(msg) => sent,
                    _ = stop.cancelled() => break,
                };
                if let Err(e) = sent {
                    return shared.finish(SessionOutcome::ClientError(e.to_string()));
                }
                drop(permit);
            }
            down_rx.close();
            let drained = tokio::time::timeout(cfg.drain_grace, async {
                while let Some((msg, _permit)) = down_rx.recv().await {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                debug!("drain grace elapsed, discarding queued client messages");
            }
        };

        let idle_watchdog = async {
            loop {
                let idle = shared.idle_for();
                if idle >= cfg.idle_timeout {
                    return shared.finish(SessionOutcome::IdleTimeout(cfg.idle_timeout));
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(cfg.idle_timeout - idle) => {}
                }
            }
        };

        let cancel_watch = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => shared.finish(SessionOutcome::Cancelled),
                _ = stop.cancelled() => {}
            }
        };

        tokio::join!(
            client_reader,
            backend_writer,
            backend_reader,
            client_writer,
            idle_watchdog,
            cancel_watch
        );

        let outcome = lock(&shared.outcome)
            .take()
            .unwrap_or(SessionOutcome::Cancelled);
        let (up_peak, down_peak) = self.peak_outstanding();
        info!(outcome = outcome.label(), up_peak, down_peak, "bridge finished");
        outcome
    }
}

/// Turn a structured-mode client message into backend bytes.
fn encode_client_message(codec: &Mutex<Box<dyn Codec>>, msg: ChannelMessage) -> GateResult<Vec<u8>> {
    let ChannelMessage::Text(text) = msg else {
        return Err(GateError::framing(
            "structured sessions take JSON text messages {\"operation\", \"params\"}",
        ));
    };
    let op: Operation = serde_json::from_str(&text)?;
    lock(codec).encode_request(&op)
}

/// Feed backend bytes through the codec and collect what to do with them.
fn process_backend_bytes(
    codec: &mut dyn Codec,
    buffer: &mut AccumulationBuffer,
    data: &[u8],
    eof: bool,
) -> GateResult<Vec<Action>> {
    buffer.extend(data)?;
    let mut frames = codec.decode_available(buffer)?;
    if eof {
        match codec.try_decode_eof(buffer) {
            DecodeResult::Frame(frame) => frames.push(frame),
            DecodeResult::NeedMoreData => {}
            DecodeResult::Invalid(reason) => return Err(GateError::framing(reason)),
        }
    }

    let mut actions = Vec::with_capacity(frames.len());
    for frame in frames {
        match codec.advance(frame)? {
            Advance::Deliver(frame) => {
                let rendered: Value = codec.render(&frame)?;
                let envelope = Response::ok(rendered).to_json();
                actions.push(Action::Deliver(ChannelMessage::Text(envelope)));
            }
            Advance::Reply(bytes) if bytes.is_empty() => {}
            Advance::Reply(bytes) => actions.push(Action::Reply(bytes)),
        }
    }
    Ok(actions)
}

fn outcome_for(err: GateError) -> SessionOutcome {
    match err {
        GateError::Handshake(msg) => SessionOutcome::ProtocolHandshake(msg),
        GateError::Framing(msg) => SessionOutcome::ProtocolFraming(msg),
        GateError::MessageTooLarge { size, limit } => SessionOutcome::MessageTooLarge { size, limit },
        other => {
            warn!(error = %other, "unexpected error in backend pump");
            SessionOutcome::BackendError(other.to_string())
        }
    }
}

async fn queue_down(
    tx: &mpsc::Sender<Outbound>,
    gate: &Arc<BackpressureGate>,
    stop: &CancellationToken,
    msg: ChannelMessage,
) -> bool {
    // A rendered frame may exceed the mark; count it as a full window.
    let credit = msg.len().min(gate.high_water());
    let permit = tokio::select! {
        _ = stop.cancelled() => return false,
        permit = gate.reserve(credit) => permit,
    };
    let Ok(permit) = permit else { return false };
    tokio::select! {
        _ = stop.cancelled() => false,
        sent = tx.send((msg, permit)) => sent.is_ok(),
    }
}

async fn queue_up(
    tx: &mpsc::Sender<Inbound>,
    gate: &Arc<BackpressureGate>,
    stop: &CancellationToken,
    bytes: &[u8],
    max_chunk: usize,
) -> bool {
    for chunk in bytes.chunks(max_chunk.max(1)) {
        let permit = tokio::select! {
            _ = stop.cancelled() => return false,
            permit = gate.reserve(chunk.len()) => permit,
        };
        let Ok(permit) = permit else { return false };
        let sent = tokio::select! {
            _ = stop.cancelled() => return false,
            sent = tx.send((chunk.to_vec(), permit)) => sent,
        };
        if sent.is_err() {
            return false;
        }
    }
    true
}
