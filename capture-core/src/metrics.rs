//! Network and sync metrics
//!
//! One typed struct updated under a single lock. Every update bumps
//! `version` so pollers (the FFI layer, the dashboard) can skip unchanged
//! snapshots.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::sync::ConnectionType;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMetrics {
    /// Incremented on every update
    pub version: u64,
    /// Whether a controller is currently connected
    pub connected: bool,
    /// Address of the connected controller
    pub peer_address: Option<String>,
    /// Total connections accepted or established
    pub total_connections: u64,
    /// Connections replaced by a newer one
    pub preempted_connections: u64,
    /// Connect attempts made by the retry task
    pub reconnect_attempts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Frames that failed to decode
    pub decode_errors: u64,
    pub sync_pings_sent: u64,
    pub sync_pongs_matched: u64,
    /// Samples rejected for an out-of-range RTT
    pub invalid_samples: u64,
    pub last_rtt_ms: Option<i64>,
    pub last_sample_quality: Option<u8>,
    pub connection_type: ConnectionType,
    /// Discovery requests answered
    pub discovery_responses: u64,
    pub data_packets_sent: u64,
    /// Sensor packets dropped because the queue was full
    pub data_packets_dropped: u64,
}

/// Thread-safe metrics handle
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics {
    inner: Arc<RwLock<NetworkMetrics>>,
}

impl SharedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update and bump the version
    pub fn update(&self, f: impl FnOnce(&mut NetworkMetrics)) {
        let mut metrics = self.inner.write();
        f(&mut metrics);
        metrics.version += 1;
    }

    pub fn snapshot(&self) -> NetworkMetrics {
        self.inner.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn connection_established(&self, peer: String, preempted: bool) {
        self.update(|m| {
            m.connected = true;
            m.peer_address = Some(peer);
            m.total_connections += 1;
            if preempted {
                m.preempted_connections += 1;
            }
        });
    }

    pub fn connection_closed(&self) {
        self.update(|m| {
            m.connected = false;
            m.peer_address = None;
        });
    }

    pub fn sync_sample(&self, rtt_ms: i64, quality: u8, transport: ConnectionType, valid: bool) {
        self.update(|m| {
            m.sync_pongs_matched += 1;
            m.last_rtt_ms = Some(rtt_ms);
            m.last_sample_quality = Some(quality);
            m.connection_type = transport;
            if !valid {
                m.invalid_samples += 1;
            }
        });
    }
}
