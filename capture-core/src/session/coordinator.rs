//! Session coordination
//!
//! Markers, the master clock role per session and the scheduled coordinated
//! start. A coordinated start is a deferred task that fires when the
//! synchronized clock reaches the agreed instant; the error between the
//! agreed and the actual instant is kept for later inspection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::network::{ChannelError, ChannelHandle};
use crate::protocol::{
    CoordinatedStartPayload, MasterClockRequestPayload, MasterClockResponsePayload, Payload,
    StartRequestPayload,
};
use crate::session::marker::{MarkerLog, MarkerType, SessionMarker};
use crate::sync::SyncEngine;

/// Timing records kept for diagnostics
const MAX_TIMING_RECORDS: usize = 20;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Start time {start_time} already passed by {late_by_ms}ms")]
    StartTimePassed { start_time: i64, late_by_ms: i64 },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Our clock role within one session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClockRole {
    #[default]
    Unassigned,
    /// We asked to be master and wait for the controller's answer
    Pending,
    Master,
    Slave { master_id: String },
}

/// How far the actual start landed from the agreed instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingRecord {
    pub session_id: String,
    pub scheduled_start: i64,
    pub actual_start: i64,
    /// `actual - scheduled` in ms
    pub timing_error_ms: i64,
}

/// Passed to the start action when a scheduled start fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredStart {
    pub session_id: String,
    pub master_id: String,
    pub scheduled_start: i64,
    pub actual_start: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A start was scheduled locally (and broadcast if we are master)
    Scheduled { start_time: i64, delay_ms: i64 },
    /// We are not master; the request was forwarded
    Requested,
}

/// A start waiting for its instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStartInfo {
    pub session_id: String,
    pub master_id: String,
    pub start_time: i64,
}

struct PendingStart {
    info: PendingStartInfo,
    token: u64,
    task: AbortHandle,
}

pub struct SessionCoordinator {
    device_id: String,
    engine: Arc<SyncEngine>,
    start_lead_ms: i64,
    markers: Mutex<MarkerLog>,
    roles: Mutex<HashMap<String, ClockRole>>,
    scheduled: Mutex<Option<PendingStart>>,
    next_token: AtomicU64,
    timings: Mutex<VecDeque<TimingRecord>>,
}

impl SessionCoordinator {
    pub fn new(device_id: impl Into<String>, engine: Arc<SyncEngine>, start_lead_ms: i64) -> Self {
        Self {
            device_id: device_id.into(),
            engine,
            start_lead_ms,
            markers: Mutex::new(MarkerLog::new()),
            roles: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(None),
            next_token: AtomicU64::new(0),
            timings: Mutex::new(VecDeque::with_capacity(MAX_TIMING_RECORDS)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // -- Markers --

    /// Stamp a marker with the synchronized clock, log it and send it to the
    /// controller. A failed send is logged; the marker stays in the local log.
    pub fn create_session_marker(
        &self,
        channel: Option<&ChannelHandle>,
        session_id: &str,
        marker_type: MarkerType,
        data: BTreeMap<String, String>,
    ) -> SessionMarker {
        let marker = SessionMarker::new(
            session_id,
            marker_type,
            self.engine.synchronized_timestamp(),
            data,
        );
        self.markers.lock().push(marker.clone());

        debug!(
            "Marker {} {} at {} for session {}",
            marker.marker_type, marker.marker_id, marker.timestamp, session_id
        );

        if let Some(channel) = channel {
            let message = channel
                .message(Payload::SyncMarker(marker.clone()))
                .with_session(Some(session_id.to_string()))
                .requiring_ack(true);
            if let Err(e) = channel.send(message) {
                warn!("Failed to send marker {}: {}", marker.marker_id, e);
            }
        }

        marker
    }

    /// Keep a marker that came from the controller
    pub fn record_remote_marker(&self, marker: SessionMarker) {
        self.markers.lock().push(marker);
    }

    pub fn markers(&self) -> Vec<SessionMarker> {
        self.markers.lock().snapshot()
    }

    pub fn markers_for_session(&self, session_id: &str) -> Vec<SessionMarker> {
        self.markers.lock().for_session(session_id).cloned().collect()
    }

    // -- Master clock --

    /// Ask the controller to make us master for `session_id`
    pub fn register_as_master_clock(
        &self,
        channel: &ChannelHandle,
        session_id: &str,
    ) -> Result<(), CoordinationError> {
        {
            let mut roles = self.roles.lock();
            let role = roles.entry(session_id.to_string()).or_default();
            match role {
                ClockRole::Master | ClockRole::Slave { .. } => {
                    debug!("Master for {} already decided: {:?}", session_id, role);
                    return Ok(());
                }
                _ => *role = ClockRole::Pending,
            }
        }

        let payload = Payload::MasterClockRequest(MasterClockRequestPayload {
            session_id: session_id.to_string(),
        });
        if let Err(e) = channel.send_payload(payload, Some(session_id.to_string())) {
            self.roles.lock().remove(session_id);
            return Err(e.into());
        }

        info!("Requested master clock role for session {}", session_id);
        Ok(())
    }

    /// Apply the controller's decision. The first confirmed master for a
    /// session wins; later conflicting confirmations are ignored.
    pub fn handle_master_clock_response(&self, response: &MasterClockResponsePayload) -> ClockRole {
        let mut roles = self.roles.lock();
        let role = roles.entry(response.session_id.clone()).or_default();

        let decided_master = match &*role {
            ClockRole::Master => Some(self.device_id.as_str()),
            ClockRole::Slave { master_id } => Some(master_id.as_str()),
            _ => None,
        };

        if let Some(current) = decided_master {
            if response.confirmed && current != response.master_id {
                warn!(
                    "Ignoring master {} for session {}: {} was confirmed first",
                    response.master_id, response.session_id, current
                );
            }
            return role.clone();
        }

        *role = if !response.confirmed {
            if response.master_id == self.device_id {
                info!("Master clock request for {} was declined", response.session_id);
            }
            ClockRole::Unassigned
        } else if response.master_id == self.device_id {
            info!("Confirmed as master clock for session {}", response.session_id);
            ClockRole::Master
        } else {
            info!(
                "Device {} is master clock for session {}",
                response.master_id, response.session_id
            );
            ClockRole::Slave {
                master_id: response.master_id.clone(),
            }
        };

        role.clone()
    }

    pub fn role(&self, session_id: &str) -> ClockRole {
        self.roles.lock().get(session_id).cloned().unwrap_or_default()
    }

    pub fn is_master(&self, session_id: &str) -> bool {
        self.role(session_id) == ClockRole::Master
    }

    // -- Coordinated start --

    /// As master, pick a start instant (now + lead unless given), broadcast it
    /// and schedule it locally. Otherwise forward a START_REQUEST.
    pub fn coordinate_multi_device_start<F>(
        self: &Arc<Self>,
        channel: &ChannelHandle,
        session_id: &str,
        start_time: Option<i64>,
        on_start: F,
    ) -> Result<StartOutcome, CoordinationError>
    where
        F: FnOnce(FiredStart) + Send + 'static,
    {
        if !self.is_master(session_id) {
            let payload = Payload::StartRequest(StartRequestPayload {
                session_id: session_id.to_string(),
                requested_start_time: start_time,
            });
            channel.send_payload(payload, Some(session_id.to_string()))?;
            info!("Forwarded start request for session {}", session_id);
            return Ok(StartOutcome::Requested);
        }

        let now = self.engine.synchronized_timestamp();
        let start_time = start_time.unwrap_or(now + self.start_lead_ms);
        if start_time < now {
            return Err(CoordinationError::StartTimePassed {
                start_time,
                late_by_ms: now - start_time,
            });
        }

        let payload = CoordinatedStartPayload {
            session_id: session_id.to_string(),
            start_time,
            master_id: self.device_id.clone(),
        };
        let message = channel
            .message(Payload::CoordinatedStart(payload.clone()))
            .with_session(Some(session_id.to_string()))
            .requiring_ack(true);
        channel.send(message)?;

        let delay_ms = self.handle_coordinated_start(&payload, on_start)?;
        Ok(StartOutcome::Scheduled {
            start_time,
            delay_ms,
        })
    }

    /// Schedule `on_start` for the agreed instant, replacing any earlier
    /// schedule. Returns the delay in ms.
    pub fn handle_coordinated_start<F>(
        self: &Arc<Self>,
        payload: &CoordinatedStartPayload,
        on_start: F,
    ) -> Result<i64, CoordinationError>
    where
        F: FnOnce(FiredStart) + Send + 'static,
    {
        let now = self.engine.synchronized_timestamp();
        let delay_ms = payload.start_time - now;
        if delay_ms < 0 {
            warn!(
                "Coordinated start for {} is {}ms in the past",
                payload.session_id, -delay_ms
            );
            return Err(CoordinationError::StartTimePassed {
                start_time: payload.start_time,
                late_by_ms: -delay_ms,
            });
        }

        let info = PendingStartInfo {
            session_id: payload.session_id.clone(),
            master_id: payload.master_id.clone(),
            start_time: payload.start_time,
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;

        // Hold the slot while spawning so the task cannot fire before it is registered
        let mut slot = self.scheduled.lock();
        if let Some(previous) = slot.take() {
            info!(
                "Replacing scheduled start for {} at {}",
                previous.info.session_id, previous.info.start_time
            );
            previous.task.abort();
        }

        let coordinator = Arc::clone(self);
        let fired_info = info.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            let actual_start = coordinator.engine.synchronized_timestamp();
            if !coordinator.take_scheduled(token) {
                return;
            }
            coordinator.record_timing(&fired_info, actual_start);
            on_start(FiredStart {
                session_id: fired_info.session_id,
                master_id: fired_info.master_id,
                scheduled_start: fired_info.start_time,
                actual_start,
            });
        });

        info!(
            "Coordinated start for session {} scheduled at {} (in {}ms, master {})",
            info.session_id, info.start_time, delay_ms, info.master_id
        );
        *slot = Some(PendingStart {
            info,
            token,
            task: task.abort_handle(),
        });

        Ok(delay_ms)
    }

    /// Cancel the pending start, if any
    pub fn cancel_scheduled_start(&self, reason: &str) -> bool {
        match self.scheduled.lock().take() {
            Some(pending) => {
                pending.task.abort();
                info!(
                    "Cancelled scheduled start for {} ({})",
                    pending.info.session_id, reason
                );
                true
            }
            None => false,
        }
    }

    pub fn scheduled_start(&self) -> Option<PendingStartInfo> {
        self.scheduled.lock().as_ref().map(|p| p.info.clone())
    }

    fn take_scheduled(&self, token: u64) -> bool {
        let mut slot = self.scheduled.lock();
        if slot.as_ref().map(|p| p.token) == Some(token) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn record_timing(&self, info: &PendingStartInfo, actual_start: i64) {
        let record = TimingRecord {
            session_id: info.session_id.clone(),
            scheduled_start: info.start_time,
            actual_start,
            timing_error_ms: actual_start - info.start_time,
        };
        info!(
            "Coordinated start for {} fired with timing error {}ms",
            record.session_id, record.timing_error_ms
        );

        let mut timings = self.timings.lock();
        if timings.len() >= MAX_TIMING_RECORDS {
            timings.pop_front();
        }
        timings.push_back(record);
    }

    pub fn last_timing_error(&self) -> Option<i64> {
        self.timings.lock().back().map(|r| r.timing_error_ms)
    }

    pub fn timing_records(&self) -> Vec<TimingRecord> {
        self.timings.lock().iter().cloned().collect()
    }

    /// Forget roles and pending starts (controller changed)
    pub fn reset(&self) {
        self.cancel_scheduled_start("reset");
        self.roles.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MonotonicClock, SharedClock};
    use crate::metrics::SharedMetrics;
    use crate::network::ChannelCommand;
    use crate::sync::{ConnectionType, ReportedTransport};
    use tokio::sync::{mpsc, oneshot};

    const DEVICE: &str = "device-a";

    fn coordinator(clock: SharedClock) -> Arc<SessionCoordinator> {
        let engine = Arc::new(SyncEngine::new(
            clock,
            Arc::new(ReportedTransport::new(ConnectionType::Wifi)),
            SharedMetrics::new(),
        ));
        Arc::new(SessionCoordinator::new(DEVICE, engine, 5_000))
    }

    fn setup() -> (
        Arc<SessionCoordinator>,
        ChannelHandle,
        mpsc::UnboundedReceiver<ChannelCommand>,
        SharedClock,
    ) {
        let clock: SharedClock = Arc::new(MonotonicClock::anchored_at(1_000_000));
        let (channel, commands) = ChannelHandle::detached(DEVICE, clock.clone());
        (coordinator(clock.clone()), channel, commands, clock)
    }

    fn sent(commands: &mut mpsc::UnboundedReceiver<ChannelCommand>) -> crate::protocol::EnhancedMessage {
        match commands.try_recv() {
            Ok(ChannelCommand::Send(message)) => message,
            other => panic!("expected a sent message, got {:?}", other),
        }
    }

    fn response(master: &str, confirmed: bool) -> MasterClockResponsePayload {
        MasterClockResponsePayload {
            session_id: "s1".to_string(),
            master_id: master.to_string(),
            confirmed,
        }
    }

    #[tokio::test]
    async fn test_marker_is_logged_and_sent() {
        let (coord, channel, mut commands, clock) = setup();
        let mut data = BTreeMap::new();
        data.insert("note".to_string(), "hello".to_string());

        let marker = coord.create_session_marker(Some(&channel), "s1", MarkerType::Calibration, data);
        assert_eq!(marker.timestamp, clock.now_ms());
        assert_eq!(coord.markers_for_session("s1"), vec![marker.clone()]);

        let message = sent(&mut commands);
        assert!(message.requires_ack);
        assert_eq!(message.session_id.as_deref(), Some("s1"));
        assert_eq!(message.payload, Payload::SyncMarker(marker));
    }

    #[tokio::test]
    async fn test_register_master_sends_request() {
        let (coord, channel, mut commands, _) = setup();
        coord.register_as_master_clock(&channel, "s1").unwrap();

        assert_eq!(coord.role("s1"), ClockRole::Pending);
        match sent(&mut commands).payload {
            Payload::MasterClockRequest(req) => assert_eq!(req.session_id, "s1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_confirmed_master_wins() {
        let (coord, channel, _commands, _) = setup();
        coord.register_as_master_clock(&channel, "s1").unwrap();

        let slave = ClockRole::Slave {
            master_id: "device-b".to_string(),
        };
        assert_eq!(coord.handle_master_clock_response(&response("device-b", true)), slave);
        // A later conflicting confirmation does not change the decision
        assert_eq!(coord.handle_master_clock_response(&response(DEVICE, true)), slave);
        assert!(!coord.is_master("s1"));
    }

    #[tokio::test]
    async fn test_declined_request_leaves_role_unassigned() {
        let (coord, channel, _commands, _) = setup();
        coord.register_as_master_clock(&channel, "s1").unwrap();

        assert_eq!(
            coord.handle_master_clock_response(&response(DEVICE, false)),
            ClockRole::Unassigned
        );
        assert_eq!(
            coord.handle_master_clock_response(&response(DEVICE, true)),
            ClockRole::Master
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinated_start_fires_on_time() {
        let (coord, _channel, _commands, clock) = setup();
        let start_time = clock.now_ms() + 2_000;
        let (tx, rx) = oneshot::channel();

        let delay = coord
            .handle_coordinated_start(
                &CoordinatedStartPayload {
                    session_id: "s1".to_string(),
                    start_time,
                    master_id: "device-b".to_string(),
                },
                move |fired| {
                    let _ = tx.send(fired);
                },
            )
            .unwrap();
        assert_eq!(delay, 2_000);
        assert!(coord.scheduled_start().is_some());

        let fired = rx.await.unwrap();
        assert_eq!(fired.scheduled_start, start_time);
        assert!((fired.actual_start - start_time).abs() <= 1);
        assert_eq!(coord.last_timing_error().map(|e| e.abs() <= 1), Some(true));
        assert!(coord.scheduled_start().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_in_the_past_is_rejected() {
        let (coord, _channel, _commands, clock) = setup();
        let err = coord
            .handle_coordinated_start(
                &CoordinatedStartPayload {
                    session_id: "s1".to_string(),
                    start_time: clock.now_ms() - 50,
                    master_id: "device-b".to_string(),
                },
                |_| panic!("must not fire"),
            )
            .unwrap_err();

        assert!(matches!(err, CoordinationError::StartTimePassed { late_by_ms: 50, .. }));
        assert!(coord.scheduled_start().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_start_never_fires() {
        let (coord, _channel, _commands, clock) = setup();
        let (tx, mut rx) = oneshot::channel::<FiredStart>();
        coord
            .handle_coordinated_start(
                &CoordinatedStartPayload {
                    session_id: "s1".to_string(),
                    start_time: clock.now_ms() + 500,
                    master_id: "device-b".to_string(),
                },
                move |fired| {
                    let _ = tx.send(fired);
                },
            )
            .unwrap();

        assert!(coord.cancel_scheduled_start("test"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(coord.last_timing_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_broadcasts_and_schedules() {
        let (coord, channel, mut commands, clock) = setup();
        coord.register_as_master_clock(&channel, "s1").unwrap();
        sent(&mut commands);
        coord.handle_master_clock_response(&response(DEVICE, true));

        let now = clock.now_ms();
        let outcome = coord
            .coordinate_multi_device_start(&channel, "s1", None, |_| {})
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Scheduled {
                start_time: now + 5_000,
                delay_ms: 5_000
            }
        );

        let message = sent(&mut commands);
        assert!(message.requires_ack);
        match message.payload {
            Payload::CoordinatedStart(start) => {
                assert_eq!(start.master_id, DEVICE);
                assert_eq!(start.start_time, now + 5_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_master_forwards_request() {
        let (coord, channel, mut commands, _) = setup();
        let outcome = coord
            .coordinate_multi_device_start(&channel, "s1", Some(123), |_| {})
            .unwrap();
        assert_eq!(outcome, StartOutcome::Requested);

        match sent(&mut commands).payload {
            Payload::StartRequest(req) => assert_eq!(req.requested_start_time, Some(123)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(coord.scheduled_start().is_none());
    }
}
