//! Collector decode loop.
//!
//! One transport message is one encoded packet. Malformed messages are
//! logged and dropped without closing the connection. Decoded packets go to
//! a [`PacketSink`] together with how their sequence id relates to the
//! previous one on the same connection.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use murmur_core::wire::{self, MalformedPacket, Packet, SequenceId};

/// Where a packet's id sits relative to the last one seen on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    First,
    InOrder,
    /// Ids were skipped (a chunk lost at the producer).
    Gap { missing: u64 },
    /// Id already seen; expected under at-least-once replay.
    Duplicate,
    /// The producer restarted and began a new session at 1.
    Reset,
}

impl Continuity {
    fn classify(last: Option<SequenceId>, seq: SequenceId) -> Self {
        let Some(last) = last else {
            return Self::First;
        };
        if seq == last.saturating_add(1) {
            Self::InOrder
        } else if seq > last {
            Self::Gap {
                missing: seq - last - 1,
            }
        } else if seq == 1 && last > 1 {
            Self::Reset
        } else {
            Self::Duplicate
        }
    }
}

/// Receives everything the decode loops produce.
pub trait PacketSink: Send + Sync {
    fn packet(&self, device_id: &str, packet: &Packet, continuity: Continuity);

    fn malformed(&self, device_id: &str, error: &MalformedPacket);

    fn connection(&self, _device_id: &str, _connected: bool) {}
}

/// Per-connection decode state.
pub struct DecodeLoop {
    device_id: String,
    last_sequence_id: Option<SequenceId>,
    sink: Arc<dyn PacketSink>,
}

impl DecodeLoop {
    pub fn new(device_id: impl Into<String>, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            device_id: device_id.into(),
            last_sequence_id: None,
            sink,
        }
    }

    pub fn last_sequence_id(&self) -> Option<SequenceId> {
        self.last_sequence_id
    }

    /// Handle one transport message.
    pub fn on_message(&mut self, frame: &[u8]) -> Result<Continuity, MalformedPacket> {
        let packet = match wire::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, len = frame.len(), error = %e, "dropping malformed packet");
                self.sink.malformed(&self.device_id, &e);
                return Err(e);
            }
        };

        let seq = packet.sequence_id;
        let continuity = Continuity::classify(self.last_sequence_id, seq);
        match continuity {
            Continuity::First | Continuity::InOrder => {}
            Continuity::Gap { missing } => {
                tracing::warn!(device_id = %self.device_id, seq, missing, "sequence gap");
            }
            Continuity::Duplicate => {
                tracing::info!(device_id = %self.device_id, seq, last = ?self.last_sequence_id, "duplicate packet");
            }
            Continuity::Reset => {
                tracing::info!(device_id = %self.device_id, last = ?self.last_sequence_id, "producer session reset");
            }
        }
        self.last_sequence_id = Some(match (continuity, self.last_sequence_id) {
            (Continuity::Duplicate, Some(last)) => last,
            _ => seq,
        });

        tracing::debug!(
            device_id = %self.device_id,
            seq,
            len = packet.payload.len(),
            captured_at = packet.captured_at_millis,
            "packet received"
        );
        self.sink.packet(&self.device_id, &packet, continuity);
        Ok(continuity)
    }
}

// ── Default sink: per-device counters ────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub packets: u64,
    pub bytes: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub last_sequence_id: Option<SequenceId>,
    /// True while at least one ingest socket for the device is open.
    pub connected: bool,
    /// Open ingest sockets. A reconnect can overlap a half-open old one.
    pub connections: u32,
}

#[derive(Clone, Default)]
pub struct DeviceStats {
    devices: Arc<DashMap<String, DeviceStatus>>,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, device_id: &str) -> dashmap::mapref::one::RefMut<'_, String, DeviceStatus> {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceStatus {
                device_id: device_id.to_string(),
                ..DeviceStatus::default()
            })
    }

    /// All devices seen so far, sorted by id.
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        let mut all: Vec<DeviceStatus> = self.devices.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceStatus> {
        self.devices.get(device_id).map(|e| e.value().clone())
    }
}

impl PacketSink for DeviceStats {
    fn packet(&self, device_id: &str, packet: &Packet, continuity: Continuity) {
        let mut status = self.entry(device_id);
        status.packets += 1;
        status.bytes += packet.payload.len() as u64;
        if continuity == Continuity::Duplicate {
            status.duplicates += 1;
        } else {
            status.last_sequence_id = Some(packet.sequence_id);
        }
    }

    fn malformed(&self, device_id: &str, _error: &MalformedPacket) {
        self.entry(device_id).malformed += 1;
    }

    fn connection(&self, device_id: &str, connected: bool) {
        let mut status = self.entry(device_id);
        status.connections = if connected {
            status.connections.saturating_add(1)
        } else {
            status.connections.saturating_sub(1)
        };
        status.connected = status.connections > 0;
    }
}

/// Hands every event to each sink in turn.
pub struct Fanout(pub Vec<Arc<dyn PacketSink>>);

impl PacketSink for Fanout {
    fn packet(&self, device_id: &str, packet: &Packet, continuity: Continuity) {
        for sink in &self.0 {
            sink.packet(device_id, packet, continuity);
        }
    }

    fn malformed(&self, device_id: &str, error: &MalformedPacket) {
        for sink in &self.0 {
            sink.malformed(device_id, error);
        }
    }

    fn connection(&self, device_id: &str, connected: bool) {
        for sink in &self.0 {
            sink.connection(device_id, connected);
        }
    }
}
