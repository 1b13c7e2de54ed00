//! Message-framed duplex transport.
//!
//! The production transport is a WebSocket; tests run sessions
//! over a pair of channels with the same framing.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use super::{ClientMessage, Error, ServerMessage};

/// Ordered, binary-safe, reliable for the lifetime of the
/// connection. Sessions exclusively own their transport.
#[async_trait]
pub trait Transport: Send {
    /// Send one message. Applies the transport's write timeout.
    async fn send(&mut self, message: ServerMessage) -> Result<(), Error>;

    /// Receive the next message. `None` means the peer closed
    /// the connection cleanly.
    async fn recv(&mut self) -> Result<Option<ClientMessage>, Error>;

    /// Close the connection. Best effort.
    async fn close(&mut self);
}

/// WebSocket transport used by connected replicas.
pub struct WebSocketTransport {
    socket: WebSocket,
    write_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket, write_timeout: Duration) -> Self {
        Self {
            socket,
            write_timeout,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: ServerMessage) -> Result<(), Error> {
        let text = serde_json::to_string(&message)?;
        trace!("--> {}", text);

        match timeout(self.write_timeout, self.socket.send(Message::Text(text.into()))).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::WriteTimeout),
        }
    }

    async fn recv(&mut self) -> Result<Option<ClientMessage>, Error> {
        loop {
            let message = match self.socket.next().await {
                Some(message) => message?,
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    trace!("<-- {}", text);
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Message::Binary(bytes) => {
                    return Ok(Some(serde_json::from_slice(&bytes)?));
                }
                // Pings are answered by the socket itself.
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// In-process transport over channels. Same framing guarantees
/// as the WebSocket; used by the test harness.
pub struct ChannelTransport {
    tx: mpsc::Sender<ServerMessage>,
    rx: mpsc::Receiver<ClientMessage>,
}

/// The replica end of a [`ChannelTransport`] pair.
pub struct ChannelClient {
    pub tx: mpsc::Sender<ClientMessage>,
    pub rx: mpsc::Receiver<ServerMessage>,
}

impl ChannelTransport {
    /// A connected transport pair. `capacity` bounds the
    /// server-to-client direction; a replica that stops reading
    /// blocks the server's sends once it fills.
    pub fn pair(capacity: usize) -> (Self, ChannelClient) {
        let (server_tx, client_rx) = mpsc::channel(capacity);
        let (client_tx, server_rx) = mpsc::channel(capacity);

        (
            Self {
                tx: server_tx,
                rx: server_rx,
            },
            ChannelClient {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: ServerMessage) -> Result<(), Error> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<ClientMessage>, Error> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
