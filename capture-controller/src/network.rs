//! Network handling for the controller
//!
//! The controller finds a device through discovery, connects to its command
//! channel and acts as the time reference: it answers every SYNC_PING with
//! its own clock. It also elects master clocks and turns start requests
//! into coordinated starts.

use crate::metrics::{ControllerStatus, DeviceInfo, LogLevel, Metrics};
use capture_core::clock::{Clock, MonotonicClock, SharedClock};
use capture_core::metrics::SharedMetrics;
use capture_core::network::{discover_devices, ChannelEvent, ChannelHandle, ChannelManager};
use capture_core::protocol::{
    CommandPayload, CoordinatedStartPayload, DataPacket, EnhancedMessage, HeartbeatAckPayload,
    MarkerAckPayload, MasterClockResponsePayload, Payload, PongPayload, StartRequestPayload,
    StatusRequestPayload,
};
use capture_core::{ConnectionType, CoreConfig, DeviceCommand, SyncEngine};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long each discovery round waits for answers
const DISCOVERY_WAIT: Duration = Duration::from_secs(2);

/// Lead time for coordinated starts issued from the dashboard
const DEFAULT_START_LEAD_MS: i64 = 3000;

/// Commands issued from the dashboard or stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Prepare,
    Start,
    Stop,
    Status,
    Reset,
    /// START with a `startTime` a few seconds ahead on our clock
    CoordinatedStart,
}

impl ControlCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "prepare" | "p" => Some(ControlCommand::Prepare),
            "start" | "s" => Some(ControlCommand::Start),
            "stop" | "x" => Some(ControlCommand::Stop),
            "status" | "i" => Some(ControlCommand::Status),
            "reset" | "r" => Some(ControlCommand::Reset),
            "sync-start" | "c" => Some(ControlCommand::CoordinatedStart),
            _ => None,
        }
    }
}

/// Controller settings from the command line and environment
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub controller_id: String,
    /// Skip discovery and dial this address
    pub connect: Option<SocketAddr>,
    pub core: CoreConfig,
}

impl ControllerConfig {
    pub fn from_env(connect: Option<SocketAddr>) -> Self {
        let controller_id = std::env::var("CONTROLLER_DEVICE")
            .unwrap_or_else(|_| format!("pc-controller-{}", capture_core::random_id(4)));
        let core = CoreConfig::from_env().with_device(controller_id.clone(), "PC Controller");
        Self {
            controller_id,
            connect,
            core,
        }
    }
}

/// First-come master clock election, one master per session
#[derive(Debug, Default)]
pub struct MasterElection {
    masters: HashMap<String, String>,
}

impl MasterElection {
    /// Claim the master role for `device_id`. Returns the session's master,
    /// which is the earlier claimant if there was one.
    pub fn claim(&mut self, session_id: &str, device_id: &str) -> &str {
        self.masters
            .entry(session_id.to_string())
            .or_insert_with(|| device_id.to_string())
    }

    pub fn master(&self, session_id: &str) -> Option<&str> {
        self.masters.get(session_id).map(String::as_str)
    }
}

/// Per-connection controller logic
pub struct Controller {
    clock: SharedClock,
    engine: SyncEngine,
    metrics: Arc<RwLock<Metrics>>,
    election: MasterElection,
    start_lead_ms: i64,
}

impl Controller {
    pub fn new(clock: SharedClock, metrics: Arc<RwLock<Metrics>>) -> Self {
        let engine = SyncEngine::new(
            clock.clone(),
            Arc::new(capture_core::sync::ReportedTransport::new(ConnectionType::Ethernet)),
            SharedMetrics::new(),
        );
        Self {
            clock,
            engine,
            metrics,
            election: MasterElection::default(),
            start_lead_ms: DEFAULT_START_LEAD_MS,
        }
    }

    /// React to one message from the device; returns the reply, if any
    pub fn handle_message(&mut self, message: &EnhancedMessage, received_at: i64) -> Option<Payload> {
        match &message.payload {
            Payload::SyncPing(ping) => {
                self.metrics.write().sync_pings_answered += 1;
                Some(Payload::SyncPong(self.engine.answer_sync_ping(ping, received_at)))
            }

            Payload::Ping(ping) => Some(Payload::Pong(PongPayload {
                ping_timestamp: ping.timestamp,
                timestamp: self.clock.now_ms(),
            })),

            Payload::Heartbeat(heartbeat) => {
                self.metrics.write().heartbeat_received(heartbeat);
                Some(Payload::HeartbeatAck(HeartbeatAckPayload {}))
            }

            Payload::StatusResponse(status) => {
                let mut m = self.metrics.write();
                m.status_received(status);
                m.log(
                    LogLevel::Info,
                    format!(
                        "{} is {} (offset {}ms, quality {})",
                        message.device_id, status.state, status.clock_offset, status.sync_quality
                    ),
                );
                None
            }

            Payload::CommandAck(ack) => {
                let mut m = self.metrics.write();
                m.device_state = Some(ack.state);
                m.log(
                    LogLevel::Command,
                    format!(
                        "{} acknowledged: {}",
                        ack.command,
                        ack.message.as_deref().unwrap_or("ok")
                    ),
                );
                None
            }

            Payload::SyncMarker(marker) => {
                let mut m = self.metrics.write();
                m.markers_received += 1;
                m.log(
                    LogLevel::Sync,
                    format!(
                        "Marker {} for {} at {}",
                        marker.marker_type, marker.session_id, marker.timestamp
                    ),
                );
                Some(Payload::MarkerAck(MarkerAckPayload {
                    marker_id: marker.marker_id.clone(),
                }))
            }

            Payload::MasterClockRequest(request) => {
                let master = self
                    .election
                    .claim(&request.session_id, &message.device_id)
                    .to_string();
                let mut m = self.metrics.write();
                m.masters.insert(request.session_id.clone(), master.clone());
                m.log(
                    LogLevel::Sync,
                    format!("Master clock for {}: {}", request.session_id, master),
                );
                Some(Payload::MasterClockResponse(MasterClockResponsePayload {
                    session_id: request.session_id.clone(),
                    master_id: master,
                    confirmed: true,
                }))
            }

            Payload::StartRequest(request) => Some(self.coordinated_start(request)),

            Payload::CoordinatedStartAck(ack) => {
                self.metrics.write().log(
                    LogLevel::Sync,
                    format!(
                        "Coordinated start for {} at {} accepted={}",
                        ack.session_id, ack.scheduled_start, ack.accepted
                    ),
                );
                None
            }

            Payload::Error(error) => {
                let mut m = self.metrics.write();
                m.errors_received += 1;
                m.log(
                    LogLevel::Error,
                    format!("{:?}: {}", error.error_code, error.error_message),
                );
                None
            }

            other => {
                debug!("Ignoring {:?} from {}", other.message_type(), message.device_id);
                None
            }
        }
    }

    /// Answer a START_REQUEST with the instant every device should start at
    fn coordinated_start(&mut self, request: &StartRequestPayload) -> Payload {
        let start_time = request
            .requested_start_time
            .unwrap_or_else(|| self.clock.now_ms() + self.start_lead_ms);
        let master_id = self
            .election
            .master(&request.session_id)
            .map(str::to_string)
            .unwrap_or_else(|| self.metrics.read().controller_id.clone());

        self.metrics.write().log(
            LogLevel::Sync,
            format!("Coordinated start for {} at {}", request.session_id, start_time),
        );
        Payload::CoordinatedStart(CoordinatedStartPayload {
            session_id: request.session_id.clone(),
            start_time,
            master_id,
        })
    }

    /// Build the payload for a dashboard command
    pub fn command_payload(&self, command: ControlCommand) -> Payload {
        let session_id = {
            let mut m = self.metrics.write();
            match (command, m.session_id.clone()) {
                (ControlCommand::Prepare, _) | (_, None) => {
                    let id = format!("session-{}", self.clock.now_ms());
                    m.session_id = Some(id.clone());
                    id
                }
                (_, Some(id)) => id,
            }
        };

        match command {
            ControlCommand::Status => Payload::StatusRequest(StatusRequestPayload {}),
            ControlCommand::Prepare => Payload::Command(
                CommandPayload::new(DeviceCommand::Prepare).with_session(session_id),
            ),
            ControlCommand::Start => Payload::Command(
                CommandPayload::new(DeviceCommand::Start).with_session(session_id),
            ),
            ControlCommand::CoordinatedStart => Payload::Command(
                CommandPayload::new(DeviceCommand::Start)
                    .with_session(session_id)
                    .with_parameter("startTime", self.clock.now_ms() + self.start_lead_ms),
            ),
            ControlCommand::Stop => Payload::Command(CommandPayload::new(DeviceCommand::Stop)),
            ControlCommand::Reset => Payload::Command(CommandPayload::new(DeviceCommand::Reset)),
        }
    }
}

/// Find a device, connect and serve it until the command stream closes
pub async fn run(
    config: ControllerConfig,
    metrics: Arc<RwLock<Metrics>>,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
) -> Result<(), Box<dyn Error>> {
    let clock: SharedClock = Arc::new(MonotonicClock::new());

    tokio::spawn(receive_data(config.core.data_port, Arc::clone(&metrics)));

    let target = match config.connect {
        Some(addr) => addr,
        None => discover(&config, &metrics).await?,
    };

    {
        let mut m = metrics.write();
        m.status = ControllerStatus::Connecting;
        m.log(LogLevel::Info, format!("Connecting to {}", target));
    }

    let manager = ChannelManager::new(config.core.clone(), clock.clone(), SharedMetrics::new());
    let (channel, mut events) = manager.start_client();
    channel.connect(target)?;

    let mut controller = Controller::new(clock, Arc::clone(&metrics));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                handle_event(&mut controller, &channel, &metrics, target, event);
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    info!("Command stream closed, shutting down");
                    break;
                };
                let payload = controller.command_payload(command);
                let session_id = metrics.read().session_id.clone();
                match channel.send_payload(payload, session_id) {
                    Ok(_) => {
                        let mut m = metrics.write();
                        m.commands_sent += 1;
                        m.log(LogLevel::Command, format!("Sent {:?}", command));
                    }
                    Err(e) => {
                        warn!("Failed to send {:?}: {}", command, e);
                        metrics.write().log(LogLevel::Error, format!("Send failed: {}", e));
                    }
                }
            }
        }
    }

    channel.shutdown();
    Ok(())
}

fn handle_event(
    controller: &mut Controller,
    channel: &ChannelHandle,
    metrics: &Arc<RwLock<Metrics>>,
    target: SocketAddr,
    event: ChannelEvent,
) {
    match event {
        ChannelEvent::Connected { peer } => {
            info!("Connected to device at {}", peer);
            metrics.write().connection_established(peer.to_string());
            // Ask for the current state right away
            let _ = channel.send_payload(Payload::StatusRequest(StatusRequestPayload {}), None);
        }

        ChannelEvent::Disconnected { peer, preempted } => {
            info!("Device {} disconnected", peer);
            metrics.write().connection_closed();
            if !preempted {
                metrics.write().status = ControllerStatus::Connecting;
                if let Err(e) = channel.connect(target) {
                    warn!("Could not redial {}: {}", target, e);
                }
            }
        }

        ChannelEvent::Message {
            message,
            received_at,
        } => {
            if let Some(reply) = controller.handle_message(&message, received_at) {
                if let Err(e) = channel.respond(&message, reply) {
                    warn!("Failed to reply to {}: {}", message.message_id, e);
                }
            }
        }

        ChannelEvent::DecodeFailed(e) => {
            warn!("Undecodable frame from device: {}", e);
            metrics.write().log(LogLevel::Warning, format!("Bad frame: {}", e));
        }

        ChannelEvent::ConnectFailed { addr, attempts } => {
            let mut m = metrics.write();
            m.status = ControllerStatus::Error;
            m.log(
                LogLevel::Error,
                format!("Could not connect to {} after {} attempts", addr, attempts),
            );
        }

        ChannelEvent::Error(e) => {
            metrics.write().log(LogLevel::Error, e);
        }

        ChannelEvent::Listening { .. } => {}
    }
}

/// Broadcast discovery until a device answers
async fn discover(
    config: &ControllerConfig,
    metrics: &Arc<RwLock<Metrics>>,
) -> Result<SocketAddr, Box<dyn Error>> {
    metrics.write().log(
        LogLevel::Info,
        format!("Discovering devices on UDP {}", config.core.discovery_port),
    );

    loop {
        let devices = discover_devices(config.core.discovery_port, DISCOVERY_WAIT).await?;
        let Some(first) = devices.first() else {
            debug!("No devices answered, retrying");
            continue;
        };

        let mut m = metrics.write();
        for device in &devices {
            m.device_discovered(DeviceInfo {
                device_id: device.response.device_id.clone(),
                device_name: device.response.device_name.clone(),
                address: device.address.to_string(),
                capabilities: device.response.capabilities.clone(),
            });
        }
        return Ok(first.address);
    }
}

/// Count sensor packets arriving on the data port
async fn receive_data(port: u16, metrics: Arc<RwLock<Metrics>>) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Could not bind data port {}: {}", port, e);
            metrics
                .write()
                .log(LogLevel::Warning, format!("Data port {} unavailable: {}", port, e));
            return;
        }
    };

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => match DataPacket::decode(&buf[..len]) {
                Ok(packet) => metrics.write().data_received(packet.kind),
                Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
            },
            Err(e) => {
                warn!("Data receive failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Run with plain logging (no dashboard). Commands are read from stdin.
pub async fn run_with_logging(
    config: ControllerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capture_controller=info".parse()?)
                .add_directive("capture_core=info".parse()?),
        )
        .init();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match ControlCommand::parse(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None => warn!("Unknown command {:?} (prepare, start, stop, status, reset, sync-start)", line),
            }
        }
    });

    run(config, metrics, rx).await
}
