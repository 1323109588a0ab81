//! Channel event dispatch
//!
//! One task drains the channel's event queue and routes every decoded
//! message to the component that owns it. Replies reuse the request's
//! message id.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::network::{ChannelEvent, ChannelHandle, DataStreamer};
use crate::protocol::{
    CoordinatedStartAckPayload, CoordinatedStartPayload, EnhancedMessage, ErrorPayload,
    HeartbeatAckPayload, MarkerAckPayload, Payload, PongPayload, StartRequestPayload,
};
use crate::session::ClockRole;
use crate::sync::MeasurementOutcome;

use super::CaptureContext;

pub(crate) async fn run_dispatcher(
    context: Arc<CaptureContext>,
    channel: ChannelHandle,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    streamer: DataStreamer,
) {
    while let Some(event) = events.recv().await {
        handle_channel_event(&context, &channel, &streamer, event);
    }
    debug!("Dispatcher stopped");
}

/// Handle a channel event
pub fn handle_channel_event(
    context: &Arc<CaptureContext>,
    channel: &ChannelHandle,
    streamer: &DataStreamer,
    event: ChannelEvent,
) {
    match event {
        ChannelEvent::Listening { port } => {
            info!("Waiting for controller on port {}", port);
        }

        ChannelEvent::Connected { peer } => {
            context.handlers.connection_changed(true, Some(&peer.to_string()));
            context
                .handlers
                .status(&format!("Controller connected from {}", peer));
            streamer.set_target(Some(SocketAddr::new(peer.ip(), context.config.data_port)));
            if let Err(e) = context.engine.initiate_sync_ping(channel) {
                debug!("Initial sync ping failed: {}", e);
            }
        }

        ChannelEvent::Disconnected { peer, preempted } => {
            context.handlers.connection_changed(false, Some(&peer.to_string()));
            if preempted {
                context
                    .handlers
                    .status(&format!("Controller {} replaced by a new connection", peer));
            } else {
                context.coordinator.cancel_scheduled_start("controller disconnected");
                streamer.set_target(None);
                context
                    .handlers
                    .status(&format!("Controller {} disconnected", peer));
            }
        }

        ChannelEvent::Message {
            message,
            received_at,
        } => handle_message(context, channel, message, received_at),

        ChannelEvent::DecodeFailed(error) => {
            let payload = ErrorPayload::new(error.error_code(), error.to_string());
            if let Err(e) = channel.respond_error(error.message_id(), payload) {
                debug!("Could not report decode error: {}", e);
            }
        }

        ChannelEvent::ConnectFailed { addr, attempts } => {
            context.handlers.connection_changed(false, Some(&addr.to_string()));
            context.handlers.status(&format!(
                "Could not reach controller at {} after {} attempts",
                addr, attempts
            ));
        }

        ChannelEvent::Error(message) => {
            warn!("Channel error: {}", message);
            context.handlers.status(&message);
        }
    }
}

/// Route one decoded message and send the reply, if any
pub fn handle_message(
    context: &Arc<CaptureContext>,
    channel: &ChannelHandle,
    message: EnhancedMessage,
    received_at: i64,
) {
    trace!(
        "Dispatching {:?} ({}) from {}",
        message.message_type(),
        message.message_id,
        message.device_id
    );

    let reply = match &message.payload {
        Payload::Command(command) => {
            Some(context.device.execute(command, &message.device_id, channel))
        }

        Payload::StatusRequest(_) => Some(Payload::StatusResponse(context.device.status())),

        Payload::Ping(ping) => Some(Payload::Pong(PongPayload {
            ping_timestamp: ping.timestamp,
            timestamp: context.clock.now_ms(),
        })),

        Payload::SyncPing(ping) => Some(Payload::SyncPong(
            context.engine.answer_sync_ping(ping, received_at),
        )),

        Payload::SyncPong(pong) => {
            match context.engine.handle_sync_pong(pong) {
                None => debug!("Unmatched sync pong {}", pong.ping_id),
                Some((sample, MeasurementOutcome::Rejected)) => debug!(
                    "Sync pong {} rejected, RTT {}ms",
                    pong.ping_id,
                    sample.round_trip_time()
                ),
                Some(_) => {}
            }
            None
        }

        Payload::SyncMarker(marker) => {
            context.coordinator.record_remote_marker(marker.clone());
            Some(Payload::MarkerAck(MarkerAckPayload {
                marker_id: marker.marker_id.clone(),
            }))
        }

        Payload::Heartbeat(_) => Some(Payload::HeartbeatAck(HeartbeatAckPayload {})),

        Payload::MasterClockResponse(response) => {
            let role = context.coordinator.handle_master_clock_response(response);
            let text = match role {
                ClockRole::Master => format!("Master clock for session {}", response.session_id),
                ClockRole::Slave { master_id } => format!(
                    "Following master {} for session {}",
                    master_id, response.session_id
                ),
                ClockRole::Pending | ClockRole::Unassigned => format!(
                    "No master clock for session {}",
                    response.session_id
                ),
            };
            context.handlers.status(&text);
            None
        }

        Payload::StartRequest(request) => handle_start_request(context, channel, request),

        Payload::CoordinatedStart(start) => Some(handle_coordinated_start(context, channel, start)),

        Payload::MasterClockRequest(request) => {
            debug!(
                "Ignoring master clock request for {} from {}; the controller decides",
                request.session_id, message.device_id
            );
            None
        }

        Payload::Error(error) => {
            warn!(
                "Controller reported {:?}: {}",
                error.error_code, error.error_message
            );
            context
                .handlers
                .status(&format!("Controller error: {}", error.error_message));
            None
        }

        Payload::CommandAck(_)
        | Payload::StatusResponse(_)
        | Payload::Pong(_)
        | Payload::MarkerAck(_)
        | Payload::HeartbeatAck(_)
        | Payload::CoordinatedStartAck(_) => {
            trace!("{:?} needs no reply", message.message_type());
            None
        }
    };

    if let Some(reply) = reply {
        if let Err(e) = channel.respond(&message, reply) {
            debug!("Failed to reply to {}: {}", message.message_id, e);
        }
    }
}

/// A slave asked for a start; only the session's master acts on it
fn handle_start_request(
    context: &Arc<CaptureContext>,
    channel: &ChannelHandle,
    request: &StartRequestPayload,
) -> Option<Payload> {
    if !context.coordinator.is_master(&request.session_id) {
        debug!(
            "Start request for {} ignored: not master",
            request.session_id
        );
        return None;
    }

    match context
        .device
        .coordinate_start(&request.session_id, request.requested_start_time, channel)
    {
        Ok(outcome) => {
            debug!("Start request for {}: {:?}", request.session_id, outcome);
            None
        }
        Err(e) => Some(Payload::Error(
            e.to_payload()
                .with_detail("sessionId", request.session_id.clone()),
        )),
    }
}

fn handle_coordinated_start(
    context: &Arc<CaptureContext>,
    channel: &ChannelHandle,
    start: &CoordinatedStartPayload,
) -> Payload {
    match context.device.schedule_start(
        Some(start.session_id.clone()),
        start.start_time,
        &start.master_id,
        channel,
    ) {
        Ok(_) => Payload::CoordinatedStartAck(CoordinatedStartAckPayload {
            session_id: start.session_id.clone(),
            scheduled_start: start.start_time,
            accepted: true,
        }),
        Err(e) => Payload::Error(
            e.to_payload()
                .with_detail("sessionId", start.session_id.clone()),
        ),
    }
}
