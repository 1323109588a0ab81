//! Periodic background loops
//!
//! Both loops only talk while a controller is connected and stop as soon as
//! the channel shuts down.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::network::{ChannelError, ChannelHandle};
use crate::protocol::{HeartbeatPayload, Payload};

use super::CaptureContext;

/// Issue a SYNC_PING every `sync_interval`
pub(crate) async fn sync_loop(
    context: Arc<CaptureContext>,
    channel: ChannelHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(context.config.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !channel.is_connected() {
                    continue;
                }
                if let Err(ChannelError::Closed) = context.engine.initiate_sync_ping(&channel) {
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Sync loop stopped");
}

/// Send a HEARTBEAT every `heartbeat_interval`
pub(crate) async fn heartbeat_loop(
    context: Arc<CaptureContext>,
    channel: ChannelHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(context.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nobody is connected yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !channel.is_connected() {
                    continue;
                }
                let heartbeat = Payload::Heartbeat(HeartbeatPayload {
                    state: context.device.state(),
                    is_synchronized: context.engine.is_synchronized(context.config.sync_tolerance_ms),
                });
                if let Err(ChannelError::Closed) = channel.send_payload(heartbeat, context.device.session_id()) {
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Heartbeat loop stopped");
}
