//! murmur-collector: token issuer and ingest endpoint.

use std::time::Duration;

use anyhow::{Context, Result};

use murmur_collector::CollectorState;
use murmur_core::config::CollectorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = CollectorConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CollectorConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CollectorConfig::default()
    });
    tracing::info!(devices = config.devices.len(), "murmur-collector starting");

    let state = CollectorState::new(&config);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let purge_task = {
        let tokens = state.tokens.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let purged = tokens.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired tokens removed");
                }
            }
        })
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut graceful = shutdown_tx.subscribe();
    let mut deadline = shutdown_tx.subscribe();
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            murmur_collector::shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    tokio::select! {
        r = murmur_collector::serve_until(state, listener, async move {
            let _ = graceful.recv().await;
        }) => r?,
        r = purge_task => tracing::error!("token purge task exited: {:?}", r),
        _ = async move {
            let _ = deadline.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        } => tracing::warn!("ingest sessions still open, exiting anyway"),
    }
    Ok(())
}
