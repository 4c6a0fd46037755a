//! murmur-collector: the receiving end of the uplink.
//!
//! Issues device tokens, accepts packet streams over WebSocket, and reports
//! per-device counters.

pub mod auth;
pub mod decode;
pub mod handlers;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use murmur_core::config::CollectorConfig;

pub use auth::TokenStore;
pub use decode::{Continuity, DecodeLoop, DeviceStats, DeviceStatus, Fanout, PacketSink};

#[derive(Clone)]
pub struct CollectorState {
    pub tokens: TokenStore,
    pub stats: DeviceStats,
    /// Receives every decoded packet; always includes `stats`.
    pub sink: Arc<dyn PacketSink>,
}

impl CollectorState {
    pub fn new(config: &CollectorConfig) -> Self {
        let stats = DeviceStats::new();
        Self {
            tokens: TokenStore::new(&config.devices, Duration::from_secs(config.token_ttl_secs)),
            sink: Arc::new(stats.clone()),
            stats,
        }
    }

    /// Also deliver decoded packets to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = Arc::new(Fanout(vec![Arc::new(self.stats.clone()), sink]));
        self
    }
}

pub fn router(state: CollectorState) -> Router {
    Router::new()
        .route("/auth/login", post(auth::handle_login))
        .route("/ingest", get(handlers::handle_ingest))
        .route("/status", get(handlers::handle_status))
        .fallback(handlers::handle_not_found)
        .with_state(state)
}

pub async fn serve(state: CollectorState, listener: TcpListener) -> anyhow::Result<()> {
    serve_until(state, listener, std::future::pending()).await
}

/// Serve until `shutdown` resolves, then stop accepting and return.
pub async fn serve_until<F>(
    state: CollectorState,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "collector listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("collector stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}
