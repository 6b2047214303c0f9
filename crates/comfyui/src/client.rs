//! WebSocket transport to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for one ComfyUI
//! server and implements [`Connector`]; each call to
//! [`connect`](Connector::connect) opens a fresh [`ComfyUIConnection`]
//! registered under the caller's client id.
//!
//! The session worker only sees the [`Connector`] and [`Transport`]
//! traits, so tests can drive it with scripted in-memory connections.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, FutureExt, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::RawEvent;

/// How long a liveness ping waits for the pong by default.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens transports for a session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    /// Open a new connection identified to the server as `client_id`.
    async fn connect(&self, client_id: &str) -> Result<Self::Transport, TransportError>;
}

/// A live, bidirectional event connection.
#[async_trait]
pub trait Transport: Send {
    /// Events in arrival order. The stream ends when the peer closes.
    fn events(&mut self) -> BoxStream<'_, Result<RawEvent, TransportError>>;

    /// Liveness check, run between jobs.
    ///
    /// Fails when the peer has already closed the connection or does not
    /// answer in time. Frames still buffered from earlier prompts are
    /// discarded.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection. Best effort; errors are logged, not returned.
    async fn close(&mut self);
}

/// Configuration handle for a ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    pong_timeout: Duration,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client id sent during the WebSocket handshake.
    pub client_id: String,
    ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    pong_timeout: Duration,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }

    /// Override how long [`Transport::ping`] waits for the pong.
    pub fn with_pong_timeout(mut self, pong_timeout: Duration) -> Self {
        self.pong_timeout = pong_timeout;
        self
    }

    fn endpoint(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.ws_url.trim_end_matches('/'), client_id)
    }
}

#[async_trait]
impl Connector for ComfyUIClient {
    type Transport = ComfyUIConnection;

    async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, TransportError> {
        let url = self.endpoint(client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            TransportError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
            pong_timeout: self.pong_timeout,
        })
    }
}

#[async_trait]
impl Transport for ComfyUIConnection {
    fn events(&mut self) -> BoxStream<'_, Result<RawEvent, TransportError>> {
        self.ws_stream
            .by_ref()
            .take_while(|frame| future::ready(!is_close(frame)))
            .filter_map(|frame| future::ready(to_raw_event(frame)))
            .boxed()
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.drain_buffered()?;

        self.ws_stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Protocol(format!("Ping failed: {e}")))?;

        let deadline = tokio::time::Instant::now() + self.pong_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws_stream.next())
                .await
                .map_err(|_| {
                    TransportError::Protocol(format!("No pong within {:?}", self.pong_timeout))
                })?;
            match frame {
                Some(Ok(Message::Pong(_))) => return Ok(()),
                Some(Ok(other)) => self.check_alive(other)?,
                Some(Err(e)) => return Err(receive_error(e)),
                None => return Err(stream_ended()),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(client_id = %self.client_id, error = %e, "Error closing WebSocket");
        }
    }
}

impl ComfyUIConnection {
    /// Consume every frame that is already readable without waiting.
    fn drain_buffered(&mut self) -> Result<(), TransportError> {
        let mut discarded = 0usize;
        while let Some(frame) = self.ws_stream.next().now_or_never() {
            match frame {
                Some(Ok(message)) => {
                    self.check_alive(message)?;
                    discarded += 1;
                }
                Some(Err(e)) => return Err(receive_error(e)),
                None => return Err(stream_ended()),
            }
        }
        if discarded > 0 {
            tracing::debug!(client_id = %self.client_id, discarded, "Discarded stale frames before ping");
        }
        Ok(())
    }

    /// Fail on a close frame; any other frame between jobs is stale.
    fn check_alive(&self, message: Message) -> Result<(), TransportError> {
        match message {
            Message::Close(close) => {
                tracing::info!(client_id = %self.client_id, ?close, "ComfyUI closed the connection");
                Err(TransportError::Protocol("Connection closed by server".into()))
            }
            other => {
                tracing::trace!(client_id = %self.client_id, bytes = other.len(), "Ignoring frame outside a prompt");
                Ok(())
            }
        }
    }
}

fn receive_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Protocol(format!("WebSocket receive error: {e}"))
}

fn stream_ended() -> TransportError {
    TransportError::Protocol("WebSocket stream ended".into())
}

fn is_close(frame: &Result<Message, tokio_tungstenite::tungstenite::Error>) -> bool {
    match frame {
        Ok(Message::Close(close)) => {
            tracing::info!(?close, "ComfyUI WebSocket closed");
            true
        }
        _ => false,
    }
}

/// Map one WebSocket frame to a [`RawEvent`], skipping control frames.
fn to_raw_event(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<RawEvent, TransportError>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(RawEvent::Text(text))),
        Ok(Message::Binary(bytes)) => Some(Ok(RawEvent::Binary(bytes))),
        // Pings are answered by tungstenite itself.
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(receive_error(e))),
    }
}

/// Errors from the WebSocket transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
