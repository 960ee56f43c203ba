//! In-memory client channel for tests.

use std::future::Future;
use std::pin::Pin;
use tcpgate_core::{ChannelMessage, ClientSink, ClientSource, GateError, GateResult, Response};
use tokio::sync::mpsc;

pub struct MemorySource {
    rx: mpsc::Receiver<ChannelMessage>,
}

pub struct MemorySink {
    tx: Option<mpsc::Sender<ChannelMessage>>,
}

/// The test's end of the channel.
pub struct ClientEnd {
    pub tx: mpsc::Sender<ChannelMessage>,
    pub rx: mpsc::Receiver<ChannelMessage>,
}

impl ClientEnd {
    pub async fn send_text(&self, text: impl Into<String>) {
        self.tx.send(ChannelMessage::Text(text.into())).await.unwrap();
    }

    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) {
        self.tx.send(ChannelMessage::Binary(data.into())).await.unwrap();
    }

    /// Next message, or `None` once the gateway closed its side.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Next message parsed as a response envelope.
    pub async fn recv_response(&mut self) -> Response {
        match self.rx.recv().await {
            Some(ChannelMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text envelope, got {other:?}"),
        }
    }
}

/// Build a channel pair; `capacity` bounds the gateway-to-client queue.
pub fn pair(capacity: usize) -> (MemorySource, MemorySink, ClientEnd) {
    let (client_tx, gateway_rx) = mpsc::channel(64);
    let (gateway_tx, client_rx) = mpsc::channel(capacity);
    (
        MemorySource { rx: gateway_rx },
        MemorySink { tx: Some(gateway_tx) },
        ClientEnd {
            tx: client_tx,
            rx: client_rx,
        },
    )
}

impl ClientSource for MemorySource {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<ChannelMessage>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

impl ClientSink for MemorySink {
    fn send(
        &mut self,
        msg: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| GateError::internal("send on closed channel"))?;
            tx.send(msg)
                .await
                .map_err(|_| GateError::internal("client went away"))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}
