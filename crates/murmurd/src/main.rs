//! murmurd: edge uplink daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use murmur_core::config::UplinkConfig;
use murmur_services::{
    ConnectionSupervisor, HttpTokenProvider, SupervisorSettings, UplinkManager,
    WebSocketConnector,
};

mod ingest;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = UplinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = UplinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        let mut config = UplinkConfig::default();
        config.apply_env_overrides(|k| std::env::var(k).ok());
        config
    });
    tracing::info!(
        device_id = %config.device.device_id,
        ws_url = %config.network.ws_url,
        spool = %config.spool.dir.display(),
        "murmurd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Connection + spool ───────────────────────────────────────────────────
    let provider = Arc::new(HttpTokenProvider::new(
        config.network.auth_url.clone(),
        config.device.device_id.clone(),
        config.device.device_secret.clone(),
    ));
    let connector = Arc::new(WebSocketConnector::new(config.network.ws_url.clone()));
    let supervisor = ConnectionSupervisor::new(
        provider,
        connector,
        SupervisorSettings::from(&config.network),
        shutdown_tx.subscribe(),
    );

    let manager = Arc::new(
        UplinkManager::open(&config.spool, supervisor.subscribe())
            .with_context(|| format!("failed to open spool {}", config.spool.dir.display()))?,
    );
    tracing::info!(pending = manager.pending().await, "spool ready");

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let supervisor_task = tokio::spawn(supervisor.run());

    let drain_task = tokio::spawn(manager.clone().run(shutdown_tx.subscribe()));

    let ingest_task = tokio::spawn({
        let ingest = ingest::Ingest::new(
            config.transcoder.clone(),
            manager.clone(),
            shutdown_tx.subscribe(),
        );
        async move {
            if let Err(e) = ingest.run().await {
                tracing::error!(error = %e, "ingestion failed");
            }
        }
    });

    let stats_printer = spawn_stats_printer(manager.clone(), Duration::from_secs(10));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = supervisor_task     => tracing::error!("connection supervisor exited: {:?}", r),
        r = drain_task          => tracing::error!("drain task exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
    }

    // let an in-flight chunk reach the spool
    let _ = tokio::time::timeout(Duration::from_secs(5), ingest_task).await;
    Ok(())
}

/// Log uplink counters every `every` until the task is aborted.
fn spawn_stats_printer(manager: Arc<UplinkManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let stats = manager.stats();
            let pending = manager.pending().await;
            tracing::info!(
                state = %manager.state(),
                live = stats.live,
                spooled = stats.spooled,
                replayed = stats.replayed,
                lost = stats.lost,
                pending,
                "uplink stats"
            );
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_services::{LinkSnapshot, Spool};
    use tokio::sync::watch;

    #[tokio::test]
    async fn stats_printer_keeps_logging_until_aborted() {
        let dir = std::env::temp_dir().join(format!("murmurd-stats-{}", std::process::id()));
        let (_tx, rx) = watch::channel(LinkSnapshot::disconnected(0));
        let manager = Arc::new(UplinkManager::new(
            Spool::open(&dir, false).unwrap(),
            Vec::new(),
            rx,
        ));
        let printer = spawn_stats_printer(manager, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!printer.is_finished());
        printer.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
