//! Uplink manager: routes each chunk live or to the spool, and replays the
//! spool in order whenever the connection comes back.
//!
//! Routing: a chunk goes live only when the connection is online, no drain is
//! running, and the current online epoch has been fully drained. Everything
//! else is spooled. Sequence id assignment and the routing decision happen
//! under one lock, and the drain clears its flag under that same lock once the
//! spool is empty, so a chunk can never overtake a lower id still on disk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};

use murmur_core::config::SpoolConfig;
use murmur_core::wire::{self, Packet, SequenceId};

use crate::connection::{ConnectionState, LinkHandle, LinkSnapshot, LinkWatch};
use crate::spool::{self, RecordHandle, Spool, SpoolError};

/// Wait before re-attempting a drain that stopped while still online.
const DRAIN_RETRY: Duration = Duration::from_secs(1);

/// Epochs start at 1, so this never matches an online snapshot.
const NOT_DRAINED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Live,
    Spooled,
    /// Spool append failed; the chunk is gone.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub sequence_id: SequenceId,
    pub route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Spool emptied; live traffic may resume on this epoch.
    Completed { sent: usize },
    /// Connection lost or spool I/O failed; the rest stays spooled.
    Aborted { sent: usize },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub live: u64,
    pub spooled: u64,
    pub replayed: u64,
    pub lost: u64,
}

struct RouteState {
    next_sequence_id: SequenceId,
}

/// Clears the draining flag on every exit path that did not release it
/// under the route lock.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    held: bool,
}

impl DrainGuard<'_> {
    fn release(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.held = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.flag.store(false, Ordering::Release);
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SpoolError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SpoolError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SpoolError::Task(e.to_string()))?
}

pub struct UplinkManager {
    spool: Spool,
    /// Spools sealed from earlier runs, oldest first. Drained before `spool`.
    carryover: Mutex<Vec<Spool>>,
    link: LinkWatch,
    route: Mutex<RouteState>,
    draining: AtomicBool,
    drained_epoch: AtomicU64,
    live: AtomicU64,
    spooled: AtomicU64,
    replayed: AtomicU64,
    lost: AtomicU64,
}

impl UplinkManager {
    /// Open the spool root, sealing anything a previous run left behind.
    pub fn open(config: &SpoolConfig, link: LinkWatch) -> Result<Self, SpoolError> {
        spool::seal_previous_session(&config.dir, config.fsync)?;
        let carryover = spool::carryover_spools(&config.dir, config.fsync)?;
        let spool = Spool::open(&config.dir, config.fsync)?;
        if !carryover.is_empty() {
            tracing::info!(spools = carryover.len(), "carry-over spools pending");
        }
        Ok(Self::new(spool, carryover, link))
    }

    pub fn new(spool: Spool, carryover: Vec<Spool>, link: LinkWatch) -> Self {
        Self {
            spool,
            carryover: Mutex::new(carryover),
            link,
            route: Mutex::new(RouteState {
                next_sequence_id: 1,
            }),
            draining: AtomicBool::new(false),
            drained_epoch: AtomicU64::new(NOT_DRAINED),
            live: AtomicU64::new(0),
            spooled: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Connection state as seen by routing: an online link whose epoch has
    /// not been drained yet reports `Draining`.
    pub fn state(&self) -> ConnectionState {
        let snapshot = self.link.borrow();
        if snapshot.state == ConnectionState::Online
            && (self.draining.load(Ordering::Acquire)
                || self.drained_epoch.load(Ordering::Acquire) != snapshot.epoch)
        {
            ConnectionState::Draining
        } else {
            snapshot.state
        }
    }

    pub fn stats(&self) -> UplinkStats {
        UplinkStats {
            live: self.live.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }

    /// Records waiting on disk, carry-over included.
    pub async fn pending(&self) -> usize {
        let mut spools = self.carryover.lock().await.clone();
        spools.push(self.spool.clone());
        blocking(move || Ok(spools.iter().map(Spool::count).sum::<usize>()))
            .await
            .unwrap_or(0)
    }

    /// The link to send on, if live routing is allowed right now.
    /// Must be called with the route lock held.
    fn live_target(&self, snapshot: &LinkSnapshot) -> Option<LinkHandle> {
        if self.draining.load(Ordering::Acquire) {
            return None;
        }
        if self.drained_epoch.load(Ordering::Acquire) != snapshot.epoch {
            return None;
        }
        snapshot.live_link().cloned()
    }

    /// Assign the next sequence id to `payload`, encode it, and route it.
    pub async fn handle_chunk(&self, payload: Bytes) -> ChunkOutcome {
        let mut route = self.route.lock().await;
        let sequence_id = route.next_sequence_id;
        route.next_sequence_id += 1;

        let frame = wire::encode(&Packet::new(sequence_id, payload, wire::now_millis()));
        let snapshot = self.link.borrow().clone();

        if let Some(link) = self.live_target(&snapshot) {
            match link.send(frame.clone()).await {
                Ok(()) => {
                    self.live.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(seq = sequence_id, len = frame.len(), "sent live");
                    return ChunkOutcome {
                        sequence_id,
                        route: Route::Live,
                    };
                }
                Err(e) => {
                    // later chunks must wait for this one to be replayed. After a
                    // timeout the frame may still reach the collector, which
                    // counts the replay as a duplicate.
                    self.drained_epoch.store(NOT_DRAINED, Ordering::Release);
                    tracing::warn!(seq = sequence_id, error = %e, "live send failed, spooling");
                }
            }
        }

        let spool = self.spool.clone();
        let record = frame.clone();
        match blocking(move || spool.append(&record, sequence_id)).await {
            Ok(()) => {
                self.spooled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq = sequence_id, state = %snapshot.state, "spooled");
                ChunkOutcome {
                    sequence_id,
                    route: Route::Spooled,
                }
            }
            Err(e) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                tracing::error!(seq = sequence_id, error = %e, "spool append failed, chunk lost");
                ChunkOutcome {
                    sequence_id,
                    route: Route::Lost,
                }
            }
        }
    }

    /// First spool with records in it, carry-over first. Empty carry-over
    /// directories are removed along the way.
    async fn next_batch(&self) -> Result<Option<(Spool, Vec<RecordHandle>)>, SpoolError> {
        let mut carryover = self.carryover.lock().await;
        while let Some(spool) = carryover.first().cloned() {
            let s = spool.clone();
            let records = blocking(move || s.list_ordered()).await?;
            if !records.is_empty() {
                return Ok(Some((spool, records)));
            }
            let s = spool.clone();
            match blocking(move || s.remove_dir_if_empty()).await {
                Ok(_) => tracing::info!(dir = %spool.dir().display(), "carry-over drained"),
                Err(e) => tracing::warn!(error = %e, "could not remove carry-over directory"),
            }
            carryover.remove(0);
        }
        drop(carryover);

        let s = self.spool.clone();
        let records = blocking(move || s.list_ordered()).await?;
        Ok((!records.is_empty()).then(|| (self.spool.clone(), records)))
    }

    fn still_online(&self, epoch: u64) -> bool {
        let snapshot = self.link.borrow();
        snapshot.state == ConnectionState::Online && snapshot.epoch == epoch
    }

    /// Replay spooled records in ascending order over the current link.
    /// Each record is removed only after the transport accepted it.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already running");
            return DrainOutcome::AlreadyRunning;
        }
        let mut guard = DrainGuard {
            flag: &self.draining,
            held: true,
        };

        let snapshot = self.link.borrow().clone();
        let Some(link) = snapshot.live_link().cloned() else {
            return DrainOutcome::Aborted { sent: 0 };
        };
        let epoch = snapshot.epoch;
        tracing::info!(epoch, "drain started");

        let mut sent = 0;
        loop {
            let batch = match self.next_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "drain listing failed");
                    return DrainOutcome::Aborted { sent };
                }
            };

            let Some((spool, records)) = batch else {
                // no chunk can be spooled while we hold the route lock
                let _route = self.route.lock().await;
                match self.next_batch().await {
                    Ok(None) => {
                        self.drained_epoch.store(epoch, Ordering::Release);
                        guard.release();
                        tracing::info!(epoch, sent, "drain complete");
                        return DrainOutcome::Completed { sent };
                    }
                    Ok(Some(_)) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "drain listing failed");
                        return DrainOutcome::Aborted { sent };
                    }
                }
            };

            for record in records {
                if !self.still_online(epoch) {
                    tracing::info!(epoch, sent, "connection lost, drain abandoned");
                    return DrainOutcome::Aborted { sent };
                }
                let seq = record.sequence_id;

                let (s, r) = (spool.clone(), record.clone());
                let frame = match blocking(move || s.read(&r)).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(seq, error = %e, "spool read failed, drain stopped");
                        return DrainOutcome::Aborted { sent };
                    }
                };

                if let Err(e) = link.send(frame).await {
                    tracing::info!(seq, sent, error = %e, "drain send failed, drain abandoned");
                    return DrainOutcome::Aborted { sent };
                }

                let (s, r) = (spool.clone(), record);
                if let Err(e) = blocking(move || s.remove(&r)).await {
                    tracing::warn!(seq, error = %e, "spool remove failed, drain stopped");
                    return DrainOutcome::Aborted { sent };
                }
                sent += 1;
                self.replayed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq, "replayed");
            }
        }
    }

    /// Drain once per transition into `Online`, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut link = self.link.clone();
        loop {
            let pending = {
                let snapshot = link.borrow_and_update();
                snapshot.state == ConnectionState::Online
                    && self.drained_epoch.load(Ordering::Acquire) != snapshot.epoch
            };

            let mut retry = None;
            if pending {
                match self.drain().await {
                    DrainOutcome::Completed { .. } => continue,
                    DrainOutcome::Aborted { .. } | DrainOutcome::AlreadyRunning => {
                        retry = Some(DRAIN_RETRY)
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("drain task shutting down");
                    return Ok(());
                }
                changed = link.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(retry.unwrap_or_default()), if retry.is_some() => {}
            }
        }
    }
}
