use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::protocol::{checksum, Packet};
use crate::session::DeviceIdentity;

/// Packets retained by the in-memory log.
const LOG_CAPACITY: usize = 200;

/// Packets included in a diagnostics snapshot.
const SNAPSHOT_PACKETS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketDirection {
    In,
    Out,
}

/// One logged packet: header fields only, never the payload.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub direction: PacketDirection,
    /// Four-character command tag.
    pub command: String,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: u32,
    pub payload_checksum: u32,
}

impl PacketRecord {
    pub(crate) fn describe(direction: PacketDirection, packet: &Packet) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            direction,
            command: packet.command.tag().to_string(),
            arg0: packet.arg0,
            arg1: packet.arg1,
            payload_len: packet.payload.len() as u32,
            payload_checksum: checksum(&packet.payload),
        }
    }
}

/// Bounded ring of recent packet descriptors.
#[derive(Debug, Default)]
pub(crate) struct PacketLog {
    records: VecDeque<PacketRecord>,
}

impl PacketLog {
    pub(crate) fn record(&mut self, direction: PacketDirection, packet: &Packet) {
        if self.records.len() == LOG_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(PacketRecord::describe(direction, packet));
    }

    /// The most recent packets, oldest first.
    pub(crate) fn tail(&self) -> Vec<PacketRecord> {
        let skip = self.records.len().saturating_sub(SNAPSHOT_PACKETS);
        self.records.iter().skip(skip).cloned().collect()
    }
}

/// Snapshot returned by `diagnostics()` and attached to surfaced errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub connected: bool,
    pub identity: Option<DeviceIdentity>,
    pub max_payload: u32,
    pub active_streams: usize,
    pub pending_waiters: usize,
    /// The last packets exchanged, oldest first.
    pub packets: Vec<PacketRecord>,
}
