//! WebSocket Transport Layer
//!
//! Single responsibility: move UTF-8 text frames in and out of a duplex connection.
//! No knowledge of DDP, authentication, or correlation.
//!
//! The connection is always used as two halves: a [`FrameSender`] shared by every
//! writer, and a [`FrameReceiver`] owned by exactly one reader (the dispatcher's
//! receive loop).

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::RealtimeError;

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Write half of a connection.
#[async_trait]
pub trait FrameSender: Send + 'static {
    /// Send one complete text frame.
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameReceiver: Send + 'static {
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    async fn recv_text(&mut self) -> Result<Option<String>, RealtimeError>;
}

/// A connected WebSocket.
///
/// It can only be constructed via `Transport::connect()`.
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Connect to a WebSocket endpoint such as `wss://chat.example.org/websocket`.
    pub async fn connect(url: &str) -> Result<Self, RealtimeError> {
        debug!(url = %url, "Connecting to WebSocket");

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Split into separate halves for concurrent send/receive.
    pub fn split(self) -> (WsSender, WsReceiver) {
        (WsSender { sink: self.sink }, WsReceiver { stream: self.stream })
    }
}

/// Write half of a WebSocket connection.
pub struct WsSender {
    sink: WsSink,
}

#[async_trait]
impl FrameSender for WsSender {
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| RealtimeError::Transport(format!("Failed to send: {}", e)))
    }
}

/// Read half of a WebSocket connection.
pub struct WsReceiver {
    stream: WsStream,
}

#[async_trait]
impl FrameReceiver for WsReceiver {
    async fn recv_text(&mut self) -> Result<Option<String>, RealtimeError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Server closed WebSocket");
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(RealtimeError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }
}

/// Create an in-process connection.
///
/// The first two values are the client's halves, to hand to the dispatcher.
/// The [`MemoryPeer`] plays the server: it sees every frame the client sends and
/// can inject frames, errors, or a close.
pub fn memory_pair() -> (MemorySender, MemoryReceiver, MemoryPeer) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    (
        MemorySender { tx: outbound_tx },
        MemoryReceiver { rx: inbound_rx },
        MemoryPeer {
            sent: outbound_rx,
            inbound: Some(inbound_tx),
        },
    )
}

/// Write half of an in-process connection.
pub struct MemorySender {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
        self.tx
            .send(text)
            .map_err(|_| RealtimeError::Transport("Peer hung up".into()))
    }
}

/// Read half of an in-process connection.
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Result<String, RealtimeError>>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn recv_text(&mut self) -> Result<Option<String>, RealtimeError> {
        match self.rx.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The server side of an in-process connection.
pub struct MemoryPeer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String, RealtimeError>>>,
}

impl MemoryPeer {
    /// Deliver a JSON frame to the client.
    pub fn push(&self, frame: serde_json::Value) {
        self.push_text(frame.to_string());
    }

    /// Deliver raw text to the client, valid JSON or not.
    pub fn push_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Make the client's next read fail with `error`.
    pub fn fail(&self, error: RealtimeError) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(error));
        }
    }

    /// Close the server side; the client reads end-of-stream.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Stop accepting frames; the client's next send fails.
    pub fn hang_up(&mut self) {
        self.sent.close();
    }

    /// Wait for the next frame the client sent, decoded as JSON.
    pub async fn next_sent(&mut self) -> Option<serde_json::Value> {
        let text = self.sent.recv().await?;
        serde_json::from_str(&text).ok()
    }
}
