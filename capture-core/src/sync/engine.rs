//! Sync engine
//!
//! Drives the NTP-style exchange with the controller: stamps outgoing
//! SYNC_PINGs, matches SYNC_PONGs against the pending table and feeds the
//! resulting samples to the [`ClockOffsetEstimator`]. Also answers pings when
//! this side acts as the time reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::metrics::SharedMetrics;
use crate::network::{ChannelError, ChannelHandle};
use crate::protocol::{Payload, SyncPingPayload, SyncPongPayload};
use crate::sync::estimator::{ClockOffsetEstimator, ClockOffsetState, MeasurementOutcome, SyncMeasurement};
use crate::sync::quality::{classify, ConnectionType, SharedTransportProbe};

/// Pending pings older than this are forgotten
const PENDING_PING_TIMEOUT_MS: i64 = 10_000;

/// An estimate older than this no longer counts as synchronized
pub const SYNC_FRESHNESS_MS: i64 = 30_000;

/// Minimum quality for the device to count as synchronized
pub const MIN_SYNC_QUALITY: u8 = 60;

struct PendingPing {
    client_send_time: i64,
    sequence_number: u64,
    transport: ConnectionType,
}

pub struct SyncEngine {
    clock: SharedClock,
    transport: SharedTransportProbe,
    estimator: Mutex<ClockOffsetEstimator>,
    pending: Mutex<HashMap<String, PendingPing>>,
    sequence: AtomicU64,
    metrics: SharedMetrics,
}

impl SyncEngine {
    pub fn new(clock: SharedClock, transport: SharedTransportProbe, metrics: SharedMetrics) -> Self {
        Self {
            clock,
            transport,
            estimator: Mutex::new(ClockOffsetEstimator::new()),
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn local_now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.transport.detect()
    }

    /// Stamp a new ping and remember it until the pong comes back
    pub fn create_sync_ping(&self) -> SyncPingPayload {
        let sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let ping_id = format!("sync-{}-{}", sequence_number, crate::random_id(4));
        let client_send_time = self.clock.now_ms();

        let mut pending = self.pending.lock();
        pending.retain(|_, p| client_send_time - p.client_send_time < PENDING_PING_TIMEOUT_MS);
        pending.insert(
            ping_id.clone(),
            PendingPing {
                client_send_time,
                sequence_number,
                transport: self.transport.detect(),
            },
        );

        SyncPingPayload {
            ping_id,
            client_timestamp: client_send_time,
            sequence_number,
        }
    }

    /// Send a SYNC_PING over `channel`. Returns the sequence number.
    pub fn initiate_sync_ping(&self, channel: &ChannelHandle) -> Result<u64, ChannelError> {
        let ping = self.create_sync_ping();
        let sequence_number = ping.sequence_number;
        let ping_id = ping.ping_id.clone();

        if let Err(e) = channel.send_payload(Payload::SyncPing(ping), None) {
            self.pending.lock().remove(&ping_id);
            return Err(e);
        }

        self.metrics.update(|m| m.sync_pings_sent += 1);
        tracing::trace!("Sent sync ping #{}", sequence_number);
        Ok(sequence_number)
    }

    /// Match a pong to its ping and fold the sample into the estimate.
    /// Returns `None` for unknown or expired ping ids; otherwise the sample
    /// and what the estimator did with it.
    pub fn handle_sync_pong(
        &self,
        pong: &SyncPongPayload,
    ) -> Option<(SyncMeasurement, MeasurementOutcome)> {
        let client_receive_time = self.clock.now_ms();
        let pending = self.pending.lock().remove(&pong.ping_id)?;

        if client_receive_time - pending.client_send_time >= PENDING_PING_TIMEOUT_MS {
            tracing::debug!("Sync pong {} arrived after the ping expired", pong.ping_id);
            return None;
        }

        let rtt = client_receive_time - pending.client_send_time;
        let quality = classify(rtt, pending.transport);
        let sample = SyncMeasurement::new(
            pending.client_send_time,
            pong.server_receive_timestamp,
            pong.server_send_timestamp,
            client_receive_time,
            quality,
        );

        let outcome = self
            .estimator
            .lock()
            .add_measurement(sample, client_receive_time);
        self.metrics.sync_sample(
            rtt,
            quality,
            pending.transport,
            outcome != MeasurementOutcome::Rejected,
        );

        tracing::debug!(
            "Sync #{}: RTT={}ms offset={}ms quality={} ({:?})",
            pending.sequence_number,
            rtt,
            sample.clock_offset(),
            quality,
            outcome
        );

        Some((sample, outcome))
    }

    /// Build the pong for a ping that arrived at `received_at`
    pub fn answer_sync_ping(&self, ping: &SyncPingPayload, received_at: i64) -> SyncPongPayload {
        SyncPongPayload {
            ping_id: ping.ping_id.clone(),
            client_timestamp: ping.client_timestamp,
            server_receive_timestamp: received_at,
            server_send_timestamp: self.clock.now_ms(),
            sequence_number: ping.sequence_number,
        }
    }

    /// Local clock corrected by the current offset estimate
    pub fn synchronized_timestamp(&self) -> i64 {
        self.clock.now_ms() + self.estimator.lock().current_offset()
    }

    pub fn clock_offset(&self) -> i64 {
        self.estimator.lock().current_offset()
    }

    pub fn sync_quality(&self) -> u8 {
        self.estimator.lock().current_quality()
    }

    pub fn state(&self) -> ClockOffsetState {
        self.estimator.lock().state()
    }

    pub fn history(&self) -> Vec<SyncMeasurement> {
        self.estimator.lock().history().copied().collect()
    }

    /// Good enough quality, small enough offset and a recent sample
    pub fn is_synchronized(&self, tolerance_ms: i64) -> bool {
        let state = self.state();
        let Some(last_sync) = state.last_sync_timestamp else {
            return false;
        };
        state.sync_quality >= MIN_SYNC_QUALITY
            && state.current_offset_ms.abs() <= tolerance_ms
            && self.clock.now_ms() - last_sync < SYNC_FRESHNESS_MS
    }

    pub fn pending_pings(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forget every sample and pending ping
    pub fn reset(&self) {
        self.estimator.lock().reset();
        self.pending.lock().clear();
        tracing::info!("Clock synchronization reset");
    }
}
