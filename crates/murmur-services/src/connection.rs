//! Connection state as published by the supervisor.
//!
//! The supervisor is the only writer. Everyone else holds a
//! `watch::Receiver<LinkSnapshot>` and reads immutable snapshots.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connecting,
    Online,
    /// Online, but spooled records are being replayed; live traffic is spooled.
    Draining,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// A frame queued for the live connection, answered once the transport has
/// taken it (or failed to).
pub struct SendRequest {
    pub frame: Bytes,
    pub done: oneshot::Sender<Result<(), TransportError>>,
}

/// Sending side of the live connection. Cloneable; every clone talks to the
/// same connection loop. Sends fail with [`TransportError::Closed`] once the
/// connection is gone, and with [`TransportError::Timeout`] when no verdict
/// arrives within `send_timeout`.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<SendRequest>,
    send_timeout: Duration,
}

impl LinkHandle {
    pub fn channel(depth: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<SendRequest>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx, send_timeout }, rx)
    }

    /// Hand one frame to the connection and wait for the transport's verdict.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let exchange = async {
            let (done, verdict) = oneshot::channel();
            self.tx
                .send(SendRequest { frame, done })
                .await
                .map_err(|_| TransportError::Closed)?;
            verdict.await.map_err(|_| TransportError::Closed)?
        };
        tokio::time::timeout(self.send_timeout, exchange)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Immutable view of the connection at one point in time.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub state: ConnectionState,
    /// Incremented on every transition into `Online`.
    pub epoch: u64,
    pub token: Option<Arc<str>>,
    pub link: Option<LinkHandle>,
}

impl LinkSnapshot {
    pub fn disconnected(epoch: u64) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch,
            token: None,
            link: None,
        }
    }

    pub fn online(epoch: u64, token: Arc<str>, link: LinkHandle) -> Self {
        Self {
            state: ConnectionState::Online,
            epoch,
            token: Some(token),
            link: Some(link),
        }
    }

    /// The usable live link, if the connection is online.
    pub fn live_link(&self) -> Option<&LinkHandle> {
        match self.state {
            ConnectionState::Online => self.link.as_ref().filter(|l| !l.is_closed()),
            _ => None,
        }
    }
}

pub type LinkWatch = watch::Receiver<LinkSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn send_is_answered_by_connection_loop() {
        let (link, mut rx) = LinkHandle::channel(4, WAIT);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.done.send(Ok(()));
            }
        });
        assert!(link.send(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn send_after_connection_loop_exits_is_closed() {
        let (link, rx) = LinkHandle::channel(4, WAIT);
        drop(rx);
        assert!(link.is_closed());
        assert!(matches!(
            link.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn request_dropped_unanswered_is_closed() {
        let (link, mut rx) = LinkHandle::channel(4, WAIT);
        tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        assert!(matches!(
            link.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn unanswered_send_times_out() {
        let (link, mut rx) = LinkHandle::channel(4, Duration::from_millis(50));
        let hold = tokio::spawn(async move {
            // take the request and sit on it
            let req = rx.recv().await;
            std::future::pending::<()>().await;
            drop(req);
        });
        assert!(matches!(
            link.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Timeout)
        ));
        hold.abort();
    }

    #[test]
    fn only_online_snapshots_expose_a_link() {
        let (link, _rx) = LinkHandle::channel(1, WAIT);
        let online = LinkSnapshot::online(1, Arc::from("tok"), link.clone());
        assert!(online.live_link().is_some());

        let mut connecting = online.clone();
        connecting.state = ConnectionState::Connecting;
        assert!(connecting.live_link().is_none());
        assert!(LinkSnapshot::disconnected(1).live_link().is_none());
    }
}
