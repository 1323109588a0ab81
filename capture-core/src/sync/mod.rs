//! Clock synchronization
//!
//! NTP-style offset estimation against the controller clock.

mod engine;
mod estimator;
mod quality;

pub use engine::{SyncEngine, MIN_SYNC_QUALITY, SYNC_FRESHNESS_MS};
pub use estimator::{
    ClockOffsetEstimator, ClockOffsetState, MeasurementOutcome, SyncMeasurement, HISTORY_CAPACITY,
    MAX_VALID_RTT_MS, MIN_SAMPLE_QUALITY,
};
pub use quality::{classify, ConnectionType, ReportedTransport, SharedTransportProbe, TransportProbe};
