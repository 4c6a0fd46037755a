//! Live transport: the message-framed connection to the collector.
//!
//! The supervisor opens a [`Transport`] through a [`Connector`] and owns it
//! for the lifetime of one connection. Both are traits so tests can swap the
//! WebSocket implementation for an in-memory one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake rejected with status {0}")]
    Rejected(u16),
    #[error("timed out")]
    Timeout,
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
}

/// What the peer sent us.
#[derive(Debug)]
pub enum Inbound {
    Data(Bytes),
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    /// Send one frame as one transport message.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next inbound event. Must be cancel-safe.
    async fn recv(&mut self) -> Inbound;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport, presenting `token` in the handshake.
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, TransportError>;
}

// ── WebSocket ────────────────────────────────────────────────────────────────

/// Connects to the collector's WebSocket ingest endpoint, passing the bearer
/// token as the `token` query parameter.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn url_with_token(&self, token: &str) -> Result<String, TransportError> {
        let mut url =
            reqwest::Url::parse(&self.url).map_err(|e| TransportError::Connect(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.into())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, TransportError> {
        let url = self.url_with_token(token)?;
        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => {
                    TransportError::Rejected(response.status().as_u16())
                }
                other => TransportError::Connect(other.to_string()),
            })?;
        tracing::debug!(status = response.status().as_u16(), "websocket handshake complete");
        Ok(Box::new(WebSocketTransport { ws }))
    }
}

pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.ws
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    TransportError::Closed
                }
                other => TransportError::Send(other.to_string()),
            })
    }

    async fn recv(&mut self) -> Inbound {
        loop {
            match self.ws.next().await {
                None => return Inbound::Closed,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket read failed");
                    return Inbound::Closed;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return Inbound::Closed;
                }
                Some(Ok(Message::Binary(data))) => return Inbound::Data(Bytes::from(data)),
                // pings are answered by tungstenite on the next read or write
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_as_query_parameter() {
        let c = WebSocketConnector::new("ws://collector:8080/ingest");
        assert_eq!(
            c.url_with_token("abc123").unwrap(),
            "ws://collector:8080/ingest?token=abc123"
        );
    }

    #[test]
    fn existing_query_is_preserved_and_token_escaped() {
        let c = WebSocketConnector::new("ws://collector/ingest?v=1");
        assert_eq!(
            c.url_with_token("a b&c").unwrap(),
            "ws://collector/ingest?v=1&token=a+b%26c"
        );
    }

    #[test]
    fn invalid_url_is_a_connect_failure() {
        let c = WebSocketConnector::new("not a url");
        assert!(matches!(
            c.url_with_token("t"),
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_collector_is_a_connect_failure() {
        // port 9 (discard) on loopback is closed in test environments
        let c = WebSocketConnector::new("ws://127.0.0.1:9/ingest");
        assert!(matches!(
            c.connect("t").await,
            Err(TransportError::Connect(_))
        ));
    }
}
