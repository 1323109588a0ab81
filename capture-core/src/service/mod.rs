//! Capture service
//!
//! Wires the components together and owns the background tasks: the
//! channel manager, the event dispatcher, the sync and heartbeat loops,
//! the discovery responder and the data streamer.

mod dispatch;
mod tasks;

pub use dispatch::{handle_channel_event, handle_message};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::device::{DeviceController, HandlerRegistry};
use crate::metrics::SharedMetrics;
use crate::network::{
    bind_discovery_socket, ChannelError, ChannelEvent, ChannelHandle, ChannelManager,
    DataStreamer, DiscoveryResponder,
};
use crate::session::SessionCoordinator;
use crate::sync::{SharedTransportProbe, SyncEngine};

/// How long shutdown waits for each background task
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state every task works against
pub struct CaptureContext {
    pub config: CoreConfig,
    pub clock: SharedClock,
    pub metrics: SharedMetrics,
    pub transport: SharedTransportProbe,
    pub handlers: Arc<HandlerRegistry>,
    pub engine: Arc<SyncEngine>,
    pub coordinator: Arc<SessionCoordinator>,
    pub device: Arc<DeviceController>,
}

impl CaptureContext {
    pub fn new(config: CoreConfig, clock: SharedClock, transport: SharedTransportProbe) -> Arc<Self> {
        let metrics = SharedMetrics::new();
        let handlers = Arc::new(HandlerRegistry::new());
        let engine = Arc::new(SyncEngine::new(
            clock.clone(),
            transport.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(
            config.device_id.clone(),
            engine.clone(),
            config.coordinated_start_lead_ms,
        ));
        let device = Arc::new(DeviceController::new(
            engine.clone(),
            coordinator.clone(),
            handlers.clone(),
            config.sync_tolerance_ms,
        ));

        Arc::new(Self {
            config,
            clock,
            metrics,
            transport,
            handlers,
            engine,
            coordinator,
            device,
        })
    }
}

/// A running device
pub struct CaptureService {
    context: Arc<CaptureContext>,
    channel: ChannelHandle,
    streamer: DataStreamer,
    listen_port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureService {
    /// Bind the command port and spawn every background task
    pub async fn start(context: Arc<CaptureContext>) -> Result<Self, ChannelError> {
        let manager = ChannelManager::new(
            context.config.clone(),
            context.clock.clone(),
            context.metrics.clone(),
        );
        let (channel, mut events) = manager.start().await?;

        // The manager reports the bound port before anything else
        let listen_port = match events.try_recv() {
            Ok(ChannelEvent::Listening { port }) => port,
            _ => context.config.server_port,
        };
        info!(
            "Device {} listening on port {}",
            context.config.device_id, listen_port
        );

        let shutdown_rx = channel.shutdown_signal();
        let streamer = DataStreamer::start(
            context.config.data_queue_capacity,
            context.metrics.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        let mut handles = Vec::new();

        if context.config.enable_discovery {
            match bind_discovery_socket(context.config.discovery_port).await {
                Ok(socket) => {
                    let responder = DiscoveryResponder::new(
                        &context.config,
                        context.clock.clone(),
                        context.metrics.clone(),
                    )
                    .with_server_port(listen_port);
                    handles.push(tokio::spawn(responder.run(
                        socket,
                        shutdown_rx.clone(),
                        context.config.io_timeout,
                    )));
                }
                Err(e) => {
                    warn!(
                        "Discovery disabled, could not bind port {}: {}",
                        context.config.discovery_port, e
                    );
                    context
                        .handlers
                        .status(&format!("Discovery unavailable: {}", e));
                }
            }
        }

        handles.push(tokio::spawn(dispatch::run_dispatcher(
            context.clone(),
            channel.clone(),
            events,
            streamer.clone(),
        )));
        handles.push(tokio::spawn(tasks::sync_loop(
            context.clone(),
            channel.clone(),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(tasks::heartbeat_loop(
            context.clone(),
            channel.clone(),
            shutdown_rx,
        )));

        context
            .handlers
            .status(&format!("Waiting for controller on port {}", listen_port));

        Ok(Self {
            context,
            channel,
            streamer,
            listen_port,
            tasks: handles,
        })
    }

    pub fn context(&self) -> &Arc<CaptureContext> {
        &self.context
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn streamer(&self) -> &DataStreamer {
        &self.streamer
    }

    /// Port the command channel actually bound
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Dial a known controller instead of waiting for it
    pub fn connect_to_controller(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        info!("Connecting to controller at {}", addr);
        self.channel.connect(addr)
    }

    /// Stop every task. A pending coordinated start is cancelled first.
    pub async fn shutdown(self) {
        self.context.coordinator.cancel_scheduled_start("shutdown");
        self.channel.shutdown();

        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                debug!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Capture service stopped");
    }
}
