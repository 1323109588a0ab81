//! Session implementation for FFI

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::MonotonicClock;
use crate::config::CoreConfig;
use crate::network::ChannelHandle;
use crate::protocol::DataPacket;
use crate::service::{CaptureContext, CaptureService};
use crate::session::StartOutcome;
use crate::sync::ReportedTransport;

use super::handlers::CallbackBridge;
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in ["capture_core=debug"] {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
            }
        }
        // Another subscriber may already be installed by the host app
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// A capture device as seen from Kotlin/Swift
#[derive(uniffi::Object)]
pub struct CaptureSession {
    runtime: Runtime,
    context: Arc<CaptureContext>,
    transport: Arc<ReportedTransport>,
    service: Mutex<Option<CaptureService>>,
    /// Set while `start` binds sockets outside the service lock
    starting: AtomicBool,
}

#[uniffi::export]
impl CaptureSession {
    /// Create a session. Nothing listens until [`CaptureSession::start`].
    #[uniffi::constructor]
    pub fn new(config: SessionConfig) -> Result<Self, CoreError> {
        init_tracing();

        let core_config = apply_overrides(CoreConfig::from_env(), config);
        info!(
            "Initializing capture session for {} ({})",
            core_config.device_name, core_config.device_id
        );

        let runtime = Runtime::new().map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let transport = Arc::new(ReportedTransport::new(Default::default()));
        let context = CaptureContext::new(
            core_config,
            Arc::new(MonotonicClock::new()),
            transport.clone(),
        );

        Ok(Self {
            runtime,
            context,
            transport,
            service: Mutex::new(None),
            starting: AtomicBool::new(false),
        })
    }

    /// Set the platform callback, replacing any previous one
    pub fn set_callback(&self, callback: Box<dyn CaptureCallback>) {
        let callback: Arc<dyn CaptureCallback> = Arc::from(callback);
        let bridge = Arc::new(CallbackBridge::new(callback));

        let handlers = &self.context.handlers;
        handlers.set_recording_handler(bridge.clone());
        handlers.clear_status_sinks();
        handlers.add_status_sink(bridge);
    }

    pub fn device_id(&self) -> String {
        self.context.config.device_id.clone()
    }

    /// Start listening for the controller. Returns the bound command port.
    pub fn start(&self) -> Result<u16, CoreError> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(CoreError::AlreadyRunning);
        }
        if self.service.lock().is_some() {
            self.starting.store(false, Ordering::Release);
            return Err(CoreError::AlreadyRunning);
        }

        // Binding may retry for a while; other calls must not wait on the lock
        let started = self
            .runtime
            .block_on(CaptureService::start(self.context.clone()));
        let result = started.map_err(CoreError::from).map(|service| {
            let port = service.listen_port();
            *self.service.lock() = Some(service);
            port
        });

        self.starting.store(false, Ordering::Release);
        result
    }

    /// Stop every background task. The device state is kept.
    pub fn stop(&self) {
        let service = self.service.lock().take();
        match service {
            Some(service) => self.runtime.block_on(service.shutdown()),
            None => debug!("Stop requested but the service is not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.service.lock().is_some()
    }

    /// Dial a known controller instead of waiting for discovery
    pub fn connect_to_controller(&self, host: String, port: u16) -> Result<(), CoreError> {
        let channel = self.channel()?;
        let addr = self.resolve(&host, port)?;
        channel.connect(addr)?;
        Ok(())
    }

    /// Report the transport the controller link runs over
    pub fn set_connection_type(&self, kind: ConnectionKind) {
        self.transport.report(kind.into());
    }

    // -- Clock --

    pub fn get_synchronized_timestamp(&self) -> i64 {
        self.context.engine.synchronized_timestamp()
    }

    pub fn get_clock_offset(&self) -> i64 {
        self.context.engine.clock_offset()
    }

    pub fn get_sync_quality(&self) -> u8 {
        self.context.engine.sync_quality()
    }

    pub fn is_synchronized(&self, tolerance_ms: i64) -> bool {
        self.context.engine.is_synchronized(tolerance_ms)
    }

    /// Send a SYNC_PING now instead of waiting for the next tick
    pub fn request_sync(&self) -> Result<(), CoreError> {
        let channel = self.channel()?;
        self.context.engine.initiate_sync_ping(&channel)?;
        Ok(())
    }

    // -- Device --

    pub fn get_device_status(&self) -> DeviceStatus {
        DeviceStatus::new(
            self.context.config.device_id.clone(),
            self.context.device.status(),
            self.context.device.last_error(),
        )
    }

    pub fn prepare(&self, session_id: Option<String>) -> Result<String, CoreError> {
        let channel = self.channel().ok();
        Ok(self.context.device.prepare(session_id, channel.as_ref())?)
    }

    /// Start recording locally, stamped with the synchronized clock
    pub fn start_recording(&self, session_id: Option<String>) -> Result<String, CoreError> {
        let channel = self.channel().ok();
        Ok(self
            .context
            .device
            .start_recording(session_id, None, channel.as_ref())?)
    }

    pub fn stop_recording(&self) -> Result<String, CoreError> {
        let channel = self.channel().ok();
        Ok(self.context.device.stop_recording(channel.as_ref())?)
    }

    pub fn reset(&self) -> RecordingState {
        let channel = self.channel().ok();
        self.context.device.reset(channel.as_ref()).into()
    }

    // -- Sessions --

    pub fn create_session_marker(
        &self,
        session_id: String,
        kind: MarkerKind,
        data: HashMap<String, String>,
    ) -> SessionMarkerRecord {
        let channel = self.channel().ok();
        let data: BTreeMap<String, String> = data.into_iter().collect();
        self.context
            .coordinator
            .create_session_marker(channel.as_ref(), &session_id, kind.into(), data)
            .into()
    }

    pub fn get_session_markers(&self, session_id: Option<String>) -> Vec<SessionMarkerRecord> {
        let markers = match session_id {
            Some(id) => self.context.coordinator.markers_for_session(&id),
            None => self.context.coordinator.markers(),
        };
        markers.into_iter().map(SessionMarkerRecord::from).collect()
    }

    /// Ask the controller to make this device the session's master clock
    pub fn register_as_master_clock(&self, session_id: String) -> Result<(), CoreError> {
        let channel = self.channel()?;
        self.context
            .coordinator
            .register_as_master_clock(&channel, &session_id)?;
        Ok(())
    }

    /// Start every device of the session at one instant. Returns the
    /// scheduled start when this device is master, `None` when the request
    /// was forwarded to the controller.
    pub fn coordinate_multi_device_start(
        &self,
        session_id: String,
        start_time: Option<i64>,
    ) -> Result<Option<i64>, CoreError> {
        let channel = self.channel()?;
        // The scheduled start is spawned onto our runtime
        let _guard = self.runtime.enter();
        let outcome = self
            .context
            .device
            .coordinate_start(&session_id, start_time, &channel)?;

        Ok(match outcome {
            StartOutcome::Scheduled { start_time, .. } => Some(start_time),
            StartOutcome::Requested => None,
        })
    }

    pub fn cancel_scheduled_start(&self) -> bool {
        self.context.coordinator.cancel_scheduled_start("cancelled by platform")
    }

    pub fn get_timing_records(&self) -> Vec<StartTiming> {
        self.context
            .coordinator
            .timing_records()
            .into_iter()
            .map(StartTiming::from)
            .collect()
    }

    // -- Data --

    /// Queue a sensor sample for the controller. `payload_json` must be a
    /// JSON document. Returns false if the packet was dropped.
    pub fn send_data(
        &self,
        kind: SensorKind,
        session_id: String,
        payload_json: String,
    ) -> Result<bool, CoreError> {
        let payload = serde_json::from_str(&payload_json)
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        let packet = DataPacket::new(
            kind.into(),
            self.context.engine.synchronized_timestamp(),
            session_id,
            payload,
        );

        let service = self.service.lock();
        let service = service.as_ref().ok_or(CoreError::NotRunning)?;
        Ok(service.streamer().send(packet))
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot().into()
    }
}

impl CaptureSession {
    fn channel(&self) -> Result<ChannelHandle, CoreError> {
        self.service
            .lock()
            .as_ref()
            .map(|s| s.channel().clone())
            .ok_or(CoreError::NotRunning)
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, CoreError> {
        if let Ok(ip) = host.parse() {
            return Ok(SocketAddr::new(ip, port));
        }
        let mut addrs = self
            .runtime
            .block_on(tokio::net::lookup_host((host, port)))
            .map_err(|e| CoreError::InvalidArgument(format!("{}: {}", host, e)))?;
        addrs
            .next()
            .ok_or_else(|| CoreError::InvalidArgument(format!("{} did not resolve", host)))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(service) = self.service.get_mut().take() {
            warn!("Capture session dropped while running, shutting down");
            service.channel().shutdown();
            self.context.coordinator.cancel_scheduled_start("session dropped");
        }
    }
}

fn apply_overrides(mut config: CoreConfig, overrides: SessionConfig) -> CoreConfig {
    if let Some(id) = overrides.device_id {
        config.device_id = id;
    }
    if let Some(name) = overrides.device_name {
        config.device_name = name;
    }
    if let Some(port) = overrides.server_port {
        config.server_port = port;
    }
    if let Some(port) = overrides.discovery_port {
        config.discovery_port = port;
    }
    if let Some(port) = overrides.data_port {
        config.data_port = port;
    }
    if let Some(enabled) = overrides.enable_discovery {
        config.enable_discovery = enabled;
    }
    config
}
