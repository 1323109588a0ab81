//! Runtime configuration
//!
//! Defaults match what the PC controller expects out of the box. Individual
//! values can be overridden through environment variables.

use std::time::Duration;

/// Default TCP port for the command channel
pub const DEFAULT_SERVER_PORT: u16 = 8888;

/// Default UDP port for discovery broadcasts
pub const DEFAULT_DISCOVERY_PORT: u16 = 8889;

/// Default UDP port for outbound sensor data
pub const DEFAULT_DATA_PORT: u16 = 8890;

/// Capabilities advertised in discovery responses
const DEFAULT_CAPABILITIES: &[&str] = &["RGB_VIDEO", "THERMAL_VIDEO", "GSR", "AUDIO", "CLOCK_SYNC"];

/// Core configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Stable identifier for this device
    pub device_id: String,
    /// Human readable device name for discovery
    pub device_name: String,
    /// Capabilities advertised during discovery
    pub capabilities: Vec<String>,
    /// TCP port the command channel listens on
    pub server_port: u16,
    /// UDP port the discovery listener binds
    pub discovery_port: u16,
    /// UDP port sensor data is streamed to on the controller
    pub data_port: u16,
    /// Whether to answer discovery broadcasts
    pub enable_discovery: bool,
    /// Interval between heartbeats while connected
    pub heartbeat_interval: Duration,
    /// Interval between sync pings while connected
    pub sync_interval: Duration,
    /// Timeout applied to accept/read/recv so tasks can observe shutdown
    pub io_timeout: Duration,
    /// Base delay for connect and bind retries
    pub retry_base_delay: Duration,
    /// Upper bound on the random jitter added to connect retries
    pub retry_max_jitter: Duration,
    /// Maximum connect/bind attempts before giving up
    pub max_retry_attempts: u32,
    /// Lead time used by the master when no start time is given
    pub coordinated_start_lead_ms: i64,
    /// Offset tolerance used when reporting `isSynchronized`
    pub sync_tolerance_ms: i64,
    /// Queue depth for outbound sensor packets
    pub data_queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_id: format!("android-{}", crate::random_id(8)),
            device_name: "Android Capture Device".to_string(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            server_port: DEFAULT_SERVER_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            data_port: DEFAULT_DATA_PORT,
            enable_discovery: true,
            heartbeat_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(1),
            retry_max_jitter: Duration::from_millis(500),
            max_retry_attempts: 5,
            coordinated_start_lead_ms: 5_000,
            sync_tolerance_ms: 10,
            data_queue_capacity: 256,
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by `CAPTURE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("CAPTURE_SERVER_PORT") {
            config.server_port = port;
        }
        if let Some(port) = env_parse("CAPTURE_DISCOVERY_PORT") {
            config.discovery_port = port;
        }
        if let Some(port) = env_parse("CAPTURE_DATA_PORT") {
            config.data_port = port;
        }
        if let Some(attempts) = env_parse("CAPTURE_MAX_RETRIES") {
            config.max_retry_attempts = attempts;
        }
        if let Ok(name) = std::env::var("CAPTURE_DEVICE_NAME") {
            config.device_name = name;
        }
        if let Ok(id) = std::env::var("CAPTURE_DEVICE_ID") {
            config.device_id = id;
        }

        config
    }

    pub fn with_device(mut self, device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self.device_name = device_name.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
