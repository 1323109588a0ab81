//! Metrics tracking for the controller

use capture_core::protocol::{DataKind, HeartbeatPayload, StatusPayload};
use capture_core::DeviceState;
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, VecDeque};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Command,
    Sync,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Command => "CMD",
            LogLevel::Sync => "SYNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerStatus {
    Discovering,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ControllerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerStatus::Discovering => "DISCOVERING",
            ControllerStatus::Connecting => "CONNECTING",
            ControllerStatus::Connected => "CONNECTED",
            ControllerStatus::Disconnected => "DISCONNECTED",
            ControllerStatus::Error => "ERROR",
        }
    }
}

/// A device seen during discovery
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub address: String,
    pub capabilities: Vec<String>,
}

/// Controller metrics
pub struct Metrics {
    /// Controller start time
    pub start_time: DateTime<Local>,

    /// Id we stamp on outgoing messages
    pub controller_id: String,

    pub status: ControllerStatus,

    /// Devices answering discovery
    pub devices: Vec<DeviceInfo>,

    /// Address of the connected device
    pub peer: Option<String>,

    /// Last known device state (status response or heartbeat)
    pub device_state: Option<DeviceState>,

    pub device_synchronized: bool,

    /// Offset the device reports against our clock
    pub device_offset_ms: Option<i64>,

    pub device_sync_quality: Option<u8>,

    pub device_is_master: bool,

    pub last_timing_error_ms: Option<i64>,

    /// Session the dashboard commands act on
    pub session_id: Option<String>,

    /// Elected master per session
    pub masters: BTreeMap<String, String>,

    pub sync_pings_answered: u64,

    pub heartbeats: u64,

    pub commands_sent: u64,

    pub errors_received: u64,

    pub markers_received: u64,

    /// Sensor packets received per stream
    pub data_packets: BTreeMap<String, u64>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,
}

impl Metrics {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            start_time: Local::now(),
            controller_id: controller_id.into(),
            status: ControllerStatus::Discovering,
            devices: Vec::new(),
            peer: None,
            device_state: None,
            device_synchronized: false,
            device_offset_ms: None,
            device_sync_quality: None,
            device_is_master: false,
            last_timing_error_ms: None,
            session_id: None,
            masters: BTreeMap::new(),
            sync_pings_answered: 0,
            heartbeats: 0,
            commands_sent: 0,
            errors_received: 0,
            markers_received: 0,
            data_packets: BTreeMap::new(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a discovery answer (deduplicated by device id)
    pub fn device_discovered(&mut self, device: DeviceInfo) {
        if let Some(known) = self.devices.iter_mut().find(|d| d.device_id == device.device_id) {
            *known = device;
            return;
        }
        self.log(
            LogLevel::Info,
            format!("Found {} ({}) at {}", device.device_name, device.device_id, device.address),
        );
        self.devices.push(device);
    }

    pub fn connection_established(&mut self, peer: String) {
        self.status = ControllerStatus::Connected;
        self.log(LogLevel::Connection, format!("Connected: {}", peer));
        self.peer = Some(peer);
    }

    pub fn connection_closed(&mut self) {
        let Some(peer) = self.peer.take() else {
            return;
        };
        self.status = ControllerStatus::Disconnected;
        self.device_state = None;
        self.device_synchronized = false;
        self.log(LogLevel::Connection, format!("Disconnected: {}", peer));
    }

    pub fn status_received(&mut self, status: &StatusPayload) {
        self.device_state = Some(status.state);
        self.device_synchronized = status.is_synchronized;
        self.device_offset_ms = Some(status.clock_offset);
        self.device_sync_quality = Some(status.sync_quality);
        self.device_is_master = status.is_master;
        self.last_timing_error_ms = status.last_timing_error;
        if status.session_id.is_some() {
            self.session_id = status.session_id.clone();
        }
    }

    pub fn heartbeat_received(&mut self, heartbeat: &HeartbeatPayload) {
        self.heartbeats += 1;
        self.device_state = Some(heartbeat.state);
        self.device_synchronized = heartbeat.is_synchronized;
    }

    pub fn data_received(&mut self, kind: DataKind) {
        *self.data_packets.entry(kind.to_string()).or_default() += 1;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}
