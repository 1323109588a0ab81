//! Clock offset estimation
//!
//! Keeps a short history of NTP-style round-trip samples and turns it into a
//! quality-weighted offset between our clock and the controller's clock.

use std::collections::VecDeque;

/// Number of samples kept in the history window
pub const HISTORY_CAPACITY: usize = 10;

/// Samples below this quality are ignored when averaging
pub const MIN_SAMPLE_QUALITY: u8 = 40;

/// Number of most recent samples used for the quality score
const QUALITY_WINDOW: usize = 3;

/// Round trips at or above this are treated as lost
pub const MAX_VALID_RTT_MS: i64 = 1_000;

/// A single four-timestamp round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMeasurement {
    pub client_send_time: i64,
    pub server_receive_time: i64,
    pub server_send_time: i64,
    pub client_receive_time: i64,
    pub quality: u8,
}

impl SyncMeasurement {
    pub fn new(
        client_send_time: i64,
        server_receive_time: i64,
        server_send_time: i64,
        client_receive_time: i64,
        quality: u8,
    ) -> Self {
        Self {
            client_send_time,
            server_receive_time,
            server_send_time,
            client_receive_time,
            quality: quality.min(100),
        }
    }

    pub fn round_trip_time(&self) -> i64 {
        self.client_receive_time - self.client_send_time
    }

    /// Remote clock minus local clock
    pub fn clock_offset(&self) -> i64 {
        ((self.server_receive_time - self.client_send_time)
            + (self.server_send_time - self.client_receive_time))
            / 2
    }

    pub fn is_valid(&self) -> bool {
        let rtt = self.round_trip_time();
        rtt > 0 && rtt < MAX_VALID_RTT_MS
    }
}

/// Snapshot of the current estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffsetState {
    pub current_offset_ms: i64,
    pub sync_quality: u8,
    pub last_sync_timestamp: Option<i64>,
}

/// Result of feeding one sample to the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementOutcome {
    /// Sample accepted and the estimate was recomputed
    Updated,
    /// Sample accepted but nothing in the window is good enough to average
    Retained,
    /// Sample discarded (RTT out of range)
    Rejected,
}

#[derive(Debug, Default)]
pub struct ClockOffsetEstimator {
    history: VecDeque<SyncMeasurement>,
    state: ClockOffsetState,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            state: ClockOffsetState::default(),
        }
    }

    /// Add a sample taken at `now_ms` and recompute the estimate
    pub fn add_measurement(&mut self, sample: SyncMeasurement, now_ms: i64) -> MeasurementOutcome {
        if !sample.is_valid() {
            tracing::debug!(
                "Discarding sync sample with RTT={}ms",
                sample.round_trip_time()
            );
            return MeasurementOutcome::Rejected;
        }

        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        self.recalculate(now_ms)
    }

    fn recalculate(&mut self, now_ms: i64) -> MeasurementOutcome {
        let good: Vec<&SyncMeasurement> = self
            .history
            .iter()
            .filter(|m| m.quality >= MIN_SAMPLE_QUALITY)
            .collect();

        if good.is_empty() {
            return MeasurementOutcome::Retained;
        }

        let weight_sum: i64 = good.iter().map(|m| m.quality as i64).sum();
        let weighted: i64 = good
            .iter()
            .map(|m| m.clock_offset() * m.quality as i64)
            .sum();
        let offset = (weighted as f64 / weight_sum as f64).round() as i64;

        let recent = &good[good.len().saturating_sub(QUALITY_WINDOW)..];
        let quality_sum: u32 = recent.iter().map(|m| m.quality as u32).sum();
        let quality = (quality_sum / recent.len() as u32) as u8;

        self.state = ClockOffsetState {
            current_offset_ms: offset,
            sync_quality: quality,
            last_sync_timestamp: Some(now_ms),
        };

        tracing::debug!(
            "Clock offset updated: offset={}ms quality={} (from {} of {} samples)",
            offset,
            quality,
            good.len(),
            self.history.len()
        );

        MeasurementOutcome::Updated
    }

    pub fn current_offset(&self) -> i64 {
        self.state.current_offset_ms
    }

    pub fn current_quality(&self) -> u8 {
        self.state.sync_quality
    }

    pub fn state(&self) -> ClockOffsetState {
        self.state
    }

    /// Samples currently in the window (oldest first)
    pub fn history(&self) -> impl Iterator<Item = &SyncMeasurement> {
        self.history.iter()
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    /// Forget everything (new controller, new session)
    pub fn reset(&mut self) {
        self.history.clear();
        self.state = ClockOffsetState::default();
    }
}
