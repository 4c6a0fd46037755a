//! Murmur integration test harness.
//!
//! Every test runs a real collector on 127.0.0.1:0 and a real uplink
//! (HTTP login, WebSocket transport, supervisor, manager, on-disk spool)
//! in the same process. Network loss is simulated by a switch wrapped
//! around the WebSocket connector.

mod uplink;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use murmur_collector::{CollectorState, Continuity, PacketSink};
use murmur_core::config::{CollectorConfig, SpoolConfig};
use murmur_core::wire::{MalformedPacket, Packet, SequenceId};
use murmur_services::{
    ConnectionSupervisor, Connector, HttpTokenProvider, Inbound, SupervisorSettings, Transport,
    TransportError, UplinkManager, WebSocketConnector,
};

// ── Collector ─────────────────────────────────────────────────────────────────

/// Sink that remembers every packet the collector decoded.
#[derive(Default)]
pub struct Recorder {
    packets: Mutex<Vec<(SequenceId, Bytes)>>,
}

impl Recorder {
    pub fn ids(&self) -> Vec<SequenceId> {
        self.packets.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.packets.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}

impl PacketSink for Recorder {
    fn packet(&self, _device_id: &str, packet: &Packet, _continuity: Continuity) {
        self.packets
            .lock()
            .unwrap()
            .push((packet.sequence_id, packet.payload.clone()));
    }

    fn malformed(&self, _device_id: &str, _error: &MalformedPacket) {}
}

pub struct Collector {
    pub auth_url: String,
    pub ws_url: String,
    pub state: CollectorState,
    pub recorder: Arc<Recorder>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_collector() -> Collector {
    let recorder = Arc::new(Recorder::default());
    let state = CollectorState::new(&CollectorConfig::default()).with_sink(recorder.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(murmur_collector::serve(state.clone(), listener));
    Collector {
        auth_url: format!("http://{addr}/auth/login"),
        ws_url: format!("ws://{addr}/ingest"),
        state,
        recorder,
        task,
    }
}

// ── Network switch ────────────────────────────────────────────────────────────

/// Cuts and restores the uplink's network. While down, connects fail and
/// open connections report closure.
pub struct Switch {
    up: watch::Sender<bool>,
}

impl Switch {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: watch::channel(up).0,
        })
    }

    pub fn set(&self, up: bool) {
        self.up.send_replace(up);
    }
}

struct SwitchedConnector {
    inner: WebSocketConnector,
    switch: Arc<Switch>,
}

#[async_trait]
impl Connector for SwitchedConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, TransportError> {
        if !*self.switch.up.borrow() {
            return Err(TransportError::Connect("network down".to_string()));
        }
        let inner = self.inner.connect(token).await?;
        Ok(Box::new(SwitchedTransport {
            inner,
            up: self.switch.up.subscribe(),
        }))
    }
}

struct SwitchedTransport {
    inner: Box<dyn Transport>,
    up: watch::Receiver<bool>,
}

#[async_trait]
impl Transport for SwitchedTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !*self.up.borrow() {
            return Err(TransportError::Closed);
        }
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Inbound {
        loop {
            if !*self.up.borrow_and_update() {
                return Inbound::Closed;
            }
            tokio::select! {
                inbound = self.inner.recv() => return inbound,
                changed = self.up.changed() => {
                    if changed.is_err() {
                        return Inbound::Closed;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

// ── Uplink ────────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_spool_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "murmur-it-{tag}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub struct Uplink {
    pub manager: Arc<UplinkManager>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Uplink {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

pub fn start_uplink(
    collector: &Collector,
    device_secret: &str,
    spool_dir: &Path,
    switch: &Arc<Switch>,
) -> Uplink {
    let (shutdown, _) = broadcast::channel(1);
    let provider = Arc::new(HttpTokenProvider::new(
        collector.auth_url.clone(),
        "device-001",
        device_secret,
    ));
    let connector = Arc::new(SwitchedConnector {
        inner: WebSocketConnector::new(collector.ws_url.clone()),
        switch: switch.clone(),
    });
    let settings = SupervisorSettings {
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_interval: Duration::from_millis(20),
        auth_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        send_queue_depth: 16,
    };
    let supervisor =
        ConnectionSupervisor::new(provider, connector, settings, shutdown.subscribe());
    let spool = SpoolConfig {
        dir: spool_dir.to_path_buf(),
        fsync: false,
    };
    let manager = Arc::new(UplinkManager::open(&spool, supervisor.subscribe()).unwrap());

    let tasks = vec![
        tokio::spawn(supervisor.run()),
        tokio::spawn(manager.clone().run(shutdown.subscribe())),
    ];
    Uplink {
        manager,
        shutdown,
        tasks,
    }
}

/// Poll `cond` until it holds, failing the test after 10 seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
