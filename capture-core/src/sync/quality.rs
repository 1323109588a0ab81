//! Link quality classification
//!
//! Bluetooth links have a much higher baseline latency than WiFi or
//! Ethernet, so each transport gets its own RTT thresholds.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Transport carrying the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Wifi,
    Bluetooth,
    Ethernet,
    #[default]
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wifi => "WIFI",
            ConnectionType::Bluetooth => "BLUETOOTH",
            ConnectionType::Ethernet => "ETHERNET",
            ConnectionType::Unknown => "UNKNOWN",
        }
    }

    /// Upper RTT bounds (ms) for scores 100, 80, 60 and 40
    fn thresholds(&self) -> [i64; 4] {
        match self {
            ConnectionType::Wifi => [50, 80, 100, 200],
            ConnectionType::Bluetooth => [120, 160, 200, 300],
            ConnectionType::Ethernet => [20, 50, 80, 150],
            ConnectionType::Unknown => [10, 50, 100, 500],
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score a round trip on the given transport.
///
/// Returns one of 100, 80, 60, 40 or 20. A non-positive RTT cannot come from
/// a real exchange and scores 0.
pub fn classify(round_trip_ms: i64, transport: ConnectionType) -> u8 {
    if round_trip_ms <= 0 {
        return 0;
    }

    let [excellent, good, fair, poor] = transport.thresholds();
    match round_trip_ms {
        rtt if rtt <= excellent => 100,
        rtt if rtt <= good => 80,
        rtt if rtt <= fair => 60,
        rtt if rtt <= poor => 40,
        _ => 20,
    }
}

/// Detects the transport currently carrying traffic.
///
/// The platform layer knows the active network; the core only asks.
pub trait TransportProbe: Send + Sync {
    fn detect(&self) -> ConnectionType;
}

/// Transport probe whose answer is pushed in from outside (e.g. by the
/// Android connectivity callback through the FFI session)
#[derive(Debug, Default)]
pub struct ReportedTransport {
    current: RwLock<ConnectionType>,
}

impl ReportedTransport {
    pub fn new(initial: ConnectionType) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn report(&self, transport: ConnectionType) {
        let mut current = self.current.write();
        if *current != transport {
            tracing::info!("Transport changed: {} -> {}", *current, transport);
            *current = transport;
        }
    }
}

impl TransportProbe for ReportedTransport {
    fn detect(&self) -> ConnectionType {
        *self.current.read()
    }
}

/// Shared transport probe
pub type SharedTransportProbe = Arc<dyn TransportProbe>;
