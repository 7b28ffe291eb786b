//! I/O traits and implementations for the telemetry socket
//!
//! The transport client only ever talks to these traits, so tests can feed it
//! scripted frames without opening a socket. The default implementation uses
//! tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Result, TelemetryError};

/// Connection pair containing a reader and writer
pub struct ConnectionPair {
    /// Reader for inbound frames
    pub reader: Box<dyn FrameReader>,
    /// Writer for outbound frames
    pub writer: Box<dyn FrameWriter>,
}

// ============================================================================
// FrameReader trait and implementations
// ============================================================================

/// Trait for reading data frames from a connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next data frame
    ///
    /// Returns `Ok(Some(text))` for a data frame, `Ok(None)` once the peer has
    /// closed the connection, or an error if the socket failed.
    async fn read_frame(&mut self) -> Result<Option<String>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket implementation of FrameReader
pub struct WsFrameReader {
    stream: SplitStream<WsStream>,
}

impl WsFrameReader {
    pub fn new(stream: SplitStream<WsStream>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TelemetryError::WebSocket(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Close frame received: {:?}", frame);
                    return Ok(None);
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
            }
        }
    }
}

// ============================================================================
// FrameWriter trait and implementations
// ============================================================================

/// Trait for writing frames to a connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame
    async fn write_frame(&mut self, text: &str) -> Result<()>;

    /// Send a close frame and shut the sink down
    async fn close(&mut self) -> Result<()>;
}

/// WebSocket implementation of FrameWriter
pub struct WsFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsFrameWriter {
    pub fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::text(text.to_string()))
            .await
            .map_err(|e| TelemetryError::SendError(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| TelemetryError::WebSocket(e.to_string()))
    }
}

// ============================================================================
// Connector trait and implementations
// ============================================================================

/// Trait for opening telemetry connections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`
    async fn connect(&self, url: &str) -> Result<ConnectionPair>;
}

/// WebSocket implementation of Connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    /// Connector that gives up on the handshake after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<ConnectionPair> {
        debug!("Connecting to {} with timeout {:?}", url, self.timeout);

        let (stream, _response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    TelemetryError::ConnectionFailed(format!("Connection to {} timed out", url))
                })?
                .map_err(|e| {
                    TelemetryError::ConnectionFailed(format!(
                        "Failed to connect to {}: {}",
                        url, e
                    ))
                })?;

        debug!("WebSocket handshake completed with {}", url);

        let (sink, stream) = stream.split();
        Ok(ConnectionPair {
            reader: Box::new(WsFrameReader::new(stream)),
            writer: Box::new(WsFrameWriter::new(sink)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_returns_connection_failed() {
        let connector = WsConnector::with_timeout(Duration::from_secs(2));
        let err = match connector.connect("ws://127.0.0.1:1/ws").await {
            Ok(_) => panic!("connection to a reserved port should fail"),
            Err(e) => e,
        };

        match err {
            TelemetryError::ConnectionFailed(msg) => {
                assert!(msg.starts_with("Failed to connect to ws://127.0.0.1:1/ws"), "{msg}");
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_invalid_url_returns_connection_failed() {
        let connector = WsConnector::default();
        let result = connector.connect("not a url").await;
        assert!(matches!(result, Err(TelemetryError::ConnectionFailed(_))));
    }
}
