//! FFI types exposed via uniffi

use crate::device::{CommandError, DeviceState};
use crate::metrics::NetworkMetrics;
use crate::network::ChannelError;
use crate::protocol::{DataKind, StatusPayload};
use crate::session::{CoordinationError, MarkerType, SessionMarker, TimingRecord};
use crate::sync::ConnectionType;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Capture service is not running")]
    NotRunning,

    #[error("Capture service is already running")]
    AlreadyRunning,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Start time has passed: {0}")]
    StartTimePassed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<CommandError> for CoreError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::InvalidState(e) => CoreError::InvalidState(e.to_string()),
            CommandError::Hardware(e) => CoreError::HardwareError(e.to_string()),
            CommandError::Coordination(e) => e.into(),
        }
    }
}

impl From<CoordinationError> for CoreError {
    fn from(e: CoordinationError) -> Self {
        match e {
            CoordinationError::StartTimePassed { .. } => CoreError::StartTimePassed(e.to_string()),
            CoordinationError::Channel(e) => e.into(),
        }
    }
}

impl From<ChannelError> for CoreError {
    fn from(e: ChannelError) -> Self {
        CoreError::NetworkError(e.to_string())
    }
}

/// Transport the platform reports for the controller link
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum ConnectionKind {
    Wifi,
    Bluetooth,
    Ethernet,
    Unknown,
}

impl From<ConnectionKind> for ConnectionType {
    fn from(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Wifi => ConnectionType::Wifi,
            ConnectionKind::Bluetooth => ConnectionType::Bluetooth,
            ConnectionKind::Ethernet => ConnectionType::Ethernet,
            ConnectionKind::Unknown => ConnectionType::Unknown,
        }
    }
}

impl From<ConnectionType> for ConnectionKind {
    fn from(kind: ConnectionType) -> Self {
        match kind {
            ConnectionType::Wifi => ConnectionKind::Wifi,
            ConnectionType::Bluetooth => ConnectionKind::Bluetooth,
            ConnectionType::Ethernet => ConnectionKind::Ethernet,
            ConnectionType::Unknown => ConnectionKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum RecordingState {
    Idle,
    Preparing,
    Ready,
    Recording,
    Stopping,
    Error,
}

impl From<DeviceState> for RecordingState {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Idle => RecordingState::Idle,
            DeviceState::Preparing => RecordingState::Preparing,
            DeviceState::Ready => RecordingState::Ready,
            DeviceState::Recording => RecordingState::Recording,
            DeviceState::Stopping => RecordingState::Stopping,
            DeviceState::Error => RecordingState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MarkerKind {
    SessionStart,
    SessionEnd,
    Calibration,
    TimeReference,
    Custom,
}

impl From<MarkerKind> for MarkerType {
    fn from(kind: MarkerKind) -> Self {
        match kind {
            MarkerKind::SessionStart => MarkerType::SessionStart,
            MarkerKind::SessionEnd => MarkerType::SessionEnd,
            MarkerKind::Calibration => MarkerType::Calibration,
            MarkerKind::TimeReference => MarkerType::TimeReference,
            MarkerKind::Custom => MarkerType::Custom,
        }
    }
}

impl From<MarkerType> for MarkerKind {
    fn from(kind: MarkerType) -> Self {
        match kind {
            MarkerType::SessionStart => MarkerKind::SessionStart,
            MarkerType::SessionEnd => MarkerKind::SessionEnd,
            MarkerType::Calibration => MarkerKind::Calibration,
            MarkerType::TimeReference => MarkerKind::TimeReference,
            MarkerType::Custom => MarkerKind::Custom,
        }
    }
}

/// Sensor stream a data packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum SensorKind {
    Gsr,
    ThermalTemp,
    CameraFrame,
}

impl From<SensorKind> for DataKind {
    fn from(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Gsr => DataKind::Gsr,
            SensorKind::ThermalTemp => DataKind::ThermalTemp,
            SensorKind::CameraFrame => DataKind::CameraFrame,
        }
    }
}

/// Optional overrides applied on top of the environment configuration
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct SessionConfig {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub server_port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub data_port: Option<u16>,
    pub enable_discovery: Option<bool>,
}

/// Device status exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct DeviceStatus {
    pub device_id: String,
    pub state: RecordingState,
    pub session_id: Option<String>,
    pub is_synchronized: bool,
    pub clock_offset_ms: i64,
    pub sync_quality: u8,
    pub connection_type: ConnectionKind,
    pub is_master: bool,
    /// Error of the most recent coordinated start (actual minus scheduled)
    pub last_timing_error_ms: Option<i64>,
    /// Reason the device entered ERROR, if it did
    pub last_error: Option<String>,
}

impl DeviceStatus {
    pub fn new(device_id: String, status: StatusPayload, last_error: Option<String>) -> Self {
        Self {
            device_id,
            state: status.state.into(),
            session_id: status.session_id,
            is_synchronized: status.is_synchronized,
            clock_offset_ms: status.clock_offset,
            sync_quality: status.sync_quality,
            connection_type: status.connection_type.into(),
            is_master: status.is_master,
            last_timing_error_ms: status.last_timing_error,
            last_error,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionMarkerRecord {
    pub marker_id: String,
    pub kind: MarkerKind,
    pub session_id: String,
    pub timestamp: i64,
    pub data: std::collections::HashMap<String, String>,
}

impl From<SessionMarker> for SessionMarkerRecord {
    fn from(m: SessionMarker) -> Self {
        Self {
            marker_id: m.marker_id,
            kind: m.marker_type.into(),
            session_id: m.session_id,
            timestamp: m.timestamp,
            data: m.data.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct StartTiming {
    pub session_id: String,
    pub scheduled_start: i64,
    pub actual_start: i64,
    pub timing_error_ms: i64,
}

impl From<TimingRecord> for StartTiming {
    fn from(r: TimingRecord) -> Self {
        Self {
            session_id: r.session_id,
            scheduled_start: r.scheduled_start,
            actual_start: r.actual_start,
            timing_error_ms: r.timing_error_ms,
        }
    }
}

/// Network metrics for debug display
#[derive(Debug, Clone, uniffi::Record)]
pub struct MetricsSnapshot {
    pub version: u64,
    pub connected: bool,
    pub peer_address: Option<String>,
    pub total_connections: u64,
    pub preempted_connections: u64,
    pub reconnect_attempts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub sync_pings_sent: u64,
    pub sync_pongs_matched: u64,
    pub invalid_samples: u64,
    pub last_rtt_ms: Option<i64>,
    pub last_sample_quality: Option<u8>,
    pub connection_type: ConnectionKind,
    pub discovery_responses: u64,
    pub data_packets_sent: u64,
    pub data_packets_dropped: u64,
}

impl From<NetworkMetrics> for MetricsSnapshot {
    fn from(m: NetworkMetrics) -> Self {
        Self {
            version: m.version,
            connected: m.connected,
            peer_address: m.peer_address,
            total_connections: m.total_connections,
            preempted_connections: m.preempted_connections,
            reconnect_attempts: m.reconnect_attempts,
            messages_sent: m.messages_sent,
            messages_received: m.messages_received,
            decode_errors: m.decode_errors,
            sync_pings_sent: m.sync_pings_sent,
            sync_pongs_matched: m.sync_pongs_matched,
            invalid_samples: m.invalid_samples,
            last_rtt_ms: m.last_rtt_ms,
            last_sample_quality: m.last_sample_quality,
            connection_type: m.connection_type.into(),
            discovery_responses: m.discovery_responses,
            data_packets_sent: m.data_packets_sent,
            data_packets_dropped: m.data_packets_dropped,
        }
    }
}

/// Callback interface implemented by the platform layer
#[uniffi::export(callback_interface)]
pub trait CaptureCallback: Send + Sync {
    /// Warm up sensors. Return false to refuse.
    fn on_prepare_requested(&self, session_id: Option<String>) -> bool;
    /// Start every capture pipeline, stamping data from `start_timestamp`.
    /// Return false if recording could not be started.
    fn on_recording_start_requested(&self, session_id: String, start_timestamp: i64) -> bool;
    fn on_recording_stop_requested(&self, session_id: String) -> bool;
    fn on_status(&self, message: String);
    fn on_connection_changed(&self, connected: bool, peer_address: Option<String>);
}

