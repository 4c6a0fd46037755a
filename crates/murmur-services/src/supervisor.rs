//! Connection supervisor: owns the live connection lifecycle.
//!
//! ```text
//! Disconnected → Authenticating → Connecting → Online ─┐
//!      ▲              │ fail          │ fail           │ closed
//!      └── backoff ◄──┴───────────────┴────────────────┘
//! ```
//!
//! One explicit loop, no terminal state short of shutdown. Each connection
//! attempt gets its own control loop while online: it multiplexes queued
//! sends from [`LinkHandle`]s with closure detection on the transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use murmur_core::config::NetworkConfig;

use crate::auth::TokenProvider;
use crate::backoff::Backoff;
use crate::connection::{ConnectionState, LinkHandle, LinkSnapshot, LinkWatch, SendRequest};
use crate::transport::{Connector, Inbound, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub send_queue_depth: usize,
}

impl From<&NetworkConfig> for SupervisorSettings {
    fn from(net: &NetworkConfig) -> Self {
        Self {
            reconnect_interval: net.reconnect_interval(),
            max_reconnect_interval: net.max_reconnect_interval(),
            auth_timeout: net.auth_timeout(),
            connect_timeout: net.connect_timeout(),
            send_timeout: net.send_timeout(),
            send_queue_depth: net.send_queue_depth,
        }
    }
}

/// Why an online period ended.
enum Exit {
    Closed,
    Shutdown,
}

pub struct ConnectionSupervisor {
    provider: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    settings: SupervisorSettings,
    state_tx: watch::Sender<LinkSnapshot>,
    shutdown: broadcast::Receiver<()>,
}

impl ConnectionSupervisor {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkSnapshot::disconnected(0));
        Self {
            provider,
            connector,
            settings,
            state_tx,
            shutdown,
        }
    }

    /// Read-only view of the connection for the uplink manager.
    pub fn subscribe(&self) -> LinkWatch {
        self.state_tx.subscribe()
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(
            self.settings.reconnect_interval,
            self.settings.max_reconnect_interval,
        );
        let mut epoch = 0u64;

        loop {
            // ── Authenticating ───────────────────────────────────────────────
            self.publish_state(ConnectionState::Authenticating, epoch);
            let fetch = tokio::time::timeout(self.settings.auth_timeout, self.provider.fetch_token());
            let token = match or_shutdown(&mut self.shutdown, fetch).await {
                None => return self.stopped(epoch),
                Some(Ok(Ok(token))) => token,
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "auth failed");
                    if !self.back_off(&mut backoff, epoch).await {
                        return self.stopped(epoch);
                    }
                    continue;
                }
                Some(Err(_)) => {
                    tracing::warn!(
                        timeout_ms = self.settings.auth_timeout.as_millis() as u64,
                        "auth timed out"
                    );
                    if !self.back_off(&mut backoff, epoch).await {
                        return self.stopped(epoch);
                    }
                    continue;
                }
            };

            // ── Connecting ───────────────────────────────────────────────────
            self.publish_state(ConnectionState::Connecting, epoch);
            let connect =
                tokio::time::timeout(self.settings.connect_timeout, self.connector.connect(&token));
            let transport = match or_shutdown(&mut self.shutdown, connect).await {
                None => return self.stopped(epoch),
                Some(Ok(Ok(transport))) => transport,
                Some(result) => {
                    let e = match result {
                        Ok(Err(e)) => e,
                        _ => TransportError::Timeout,
                    };
                    tracing::warn!(error = %e, "connect failed");
                    if !self.back_off(&mut backoff, epoch).await {
                        return self.stopped(epoch);
                    }
                    continue;
                }
            };

            // ── Online ───────────────────────────────────────────────────────
            epoch += 1;
            backoff.reset();
            let (link, requests) =
                LinkHandle::channel(self.settings.send_queue_depth, self.settings.send_timeout);
            self.state_tx
                .send_replace(LinkSnapshot::online(epoch, Arc::from(token), link));
            tracing::info!(epoch, "online");

            let exit = serve(
                transport,
                requests,
                self.settings.send_timeout,
                &mut self.shutdown,
            )
            .await;
            self.state_tx.send_replace(LinkSnapshot::disconnected(epoch));
            match exit {
                Exit::Shutdown => return self.stopped(epoch),
                Exit::Closed => {
                    tracing::info!(epoch, "disconnected");
                    if !self.back_off(&mut backoff, epoch).await {
                        return self.stopped(epoch);
                    }
                }
            }
        }
    }

    fn publish_state(&self, state: ConnectionState, epoch: u64) {
        tracing::debug!(%state, epoch, "connection state");
        self.state_tx.send_replace(LinkSnapshot {
            state,
            epoch,
            token: None,
            link: None,
        });
    }

    /// Sit in `Disconnected` for the next backoff delay. False on shutdown.
    async fn back_off(&mut self, backoff: &mut Backoff, epoch: u64) -> bool {
        self.publish_state(ConnectionState::Disconnected, epoch);
        let delay = backoff.next_delay();
        tracing::debug!(backoff_ms = delay.as_millis() as u64, "retrying after backoff");
        or_shutdown(&mut self.shutdown, tokio::time::sleep(delay))
            .await
            .is_some()
    }

    fn stopped(&self, epoch: u64) -> anyhow::Result<()> {
        self.state_tx.send_replace(LinkSnapshot::disconnected(epoch));
        tracing::info!("connection supervisor shutting down");
        Ok(())
    }
}

/// Run `fut` unless shutdown fires first.
async fn or_shutdown<F: Future>(
    shutdown: &mut broadcast::Receiver<()>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.recv() => None,
        out = fut => Some(out),
    }
}

/// Control loop for one online period. A send that outlives `send_timeout`
/// is treated as a dead peer and ends the period.
async fn serve(
    mut transport: Box<dyn Transport>,
    mut requests: mpsc::Receiver<SendRequest>,
    send_timeout: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Exit {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                transport.close().await;
                return Exit::Shutdown;
            }
            request = requests.recv() => {
                let Some(SendRequest { frame, done }) = request else {
                    return Exit::Closed;
                };
                let result = tokio::time::timeout(send_timeout, transport.send(frame))
                    .await
                    .unwrap_or(Err(TransportError::Timeout));
                let failed = result.is_err();
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "live send failed");
                }
                let _ = done.send(result);
                if failed {
                    transport.close().await;
                    return Exit::Closed;
                }
            }
            inbound = transport.recv() => match inbound {
                Inbound::Closed => return Exit::Closed,
                Inbound::Data(data) => {
                    tracing::trace!(len = data.len(), "ignoring inbound message");
                }
            },
        }
    }
}
