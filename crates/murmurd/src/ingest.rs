//! Transcoder ingestion.
//!
//! Runs the configured transcoder with its output on stdout, and hands every
//! read of at most `read_chunk_bytes` to the uplink manager as one chunk.
//! Ingestion ends at EOF or shutdown; it never takes the daemon down.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::broadcast;

use murmur_core::config::TranscoderConfig;
use murmur_services::{Route, UplinkManager};

pub struct Ingest {
    config: TranscoderConfig,
    manager: Arc<UplinkManager>,
    shutdown: broadcast::Receiver<()>,
}

impl Ingest {
    pub fn new(
        config: TranscoderConfig,
        manager: Arc<UplinkManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            manager,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let args = self.config.args();
        tracing::info!(program = %self.config.program, ?args, "starting transcoder");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start transcoder {}", self.config.program))?;
        let stdout = child
            .stdout
            .take()
            .context("transcoder stdout not captured")?;

        let outcome = pump(
            stdout,
            &self.manager,
            self.config.read_chunk_bytes,
            &mut self.shutdown,
        )
        .await;

        match outcome {
            Pumped::Shutdown { chunks } => {
                tracing::info!(chunks, "stopping transcoder");
                let _ = child.kill().await;
            }
            Pumped::Eof { chunks } => match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(chunks, "transcoder finished");
                }
                Ok(status) => {
                    tracing::warn!(chunks, code = ?status.code(), "transcoder exited with failure");
                }
                Err(e) => {
                    tracing::warn!(chunks, error = %e, "could not reap transcoder");
                }
            },
            Pumped::ReadFailed { chunks, error } => {
                tracing::warn!(chunks, %error, "transcoder output read failed");
                let _ = child.kill().await;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Pumped {
    Eof { chunks: u64 },
    Shutdown { chunks: u64 },
    ReadFailed { chunks: u64, error: std::io::Error },
}

/// Feed `reader` to the manager one read at a time.
pub async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    manager: &UplinkManager,
    chunk_bytes: usize,
    shutdown: &mut broadcast::Receiver<()>,
) -> Pumped {
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut chunks = 0u64;
    loop {
        let read = tokio::select! {
            _ = shutdown.recv() => return Pumped::Shutdown { chunks },
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return Pumped::Eof { chunks },
            Ok(n) => {
                let out = manager.handle_chunk(Bytes::copy_from_slice(&buf[..n])).await;
                chunks += 1;
                if out.route == Route::Lost {
                    tracing::warn!(seq = out.sequence_id, len = n, "chunk dropped");
                }
            }
            Err(error) => return Pumped::ReadFailed { chunks, error },
        }
    }
}
