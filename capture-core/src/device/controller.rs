//! Device controller
//!
//! Executes controller commands against the state machine. Every transition
//! calls the recording handler once and leaves a synchronized marker behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::handler::{HandlerError, HandlerRegistry, RecordingHandler};
use crate::device::state::{DeviceCommand, DeviceState, DeviceStateMachine, StateError};
use crate::network::ChannelHandle;
use crate::protocol::{
    CommandAckPayload, CommandPayload, CoordinatedStartPayload, ErrorCode, ErrorPayload, Payload,
    StatusPayload,
};
use crate::session::{CoordinationError, FiredStart, MarkerType, SessionCoordinator, StartOutcome};
use crate::sync::SyncEngine;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    InvalidState(#[from] StateError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HandlerError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl CommandError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CommandError::InvalidState(_) => ErrorCode::InvalidState,
            CommandError::Hardware(_) => ErrorCode::HardwareError,
            CommandError::Coordination(CoordinationError::StartTimePassed { .. }) => {
                ErrorCode::StartTimePassed
            }
            CommandError::Coordination(CoordinationError::Channel(_)) => ErrorCode::NetworkError,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let payload = ErrorPayload::new(self.error_code(), self.to_string());
        match self {
            CommandError::InvalidState(e) => payload.with_detail("state", e.state.as_str()),
            CommandError::Coordination(CoordinationError::StartTimePassed {
                start_time,
                late_by_ms,
            }) => payload
                .with_detail("startTime", *start_time)
                .with_detail("lateByMs", *late_by_ms),
            _ => payload,
        }
    }
}

pub struct DeviceController {
    machine: Mutex<DeviceStateMachine>,
    /// Serializes transitions so the handler runs once per transition
    transition: Mutex<()>,
    engine: Arc<SyncEngine>,
    coordinator: Arc<SessionCoordinator>,
    handlers: Arc<HandlerRegistry>,
    sync_tolerance_ms: i64,
}

impl DeviceController {
    pub fn new(
        engine: Arc<SyncEngine>,
        coordinator: Arc<SessionCoordinator>,
        handlers: Arc<HandlerRegistry>,
        sync_tolerance_ms: i64,
    ) -> Self {
        Self {
            machine: Mutex::new(DeviceStateMachine::new()),
            transition: Mutex::new(()),
            engine,
            coordinator,
            handlers,
            sync_tolerance_ms,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.machine.lock().state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.machine.lock().session_id().map(str::to_string)
    }

    pub fn last_error(&self) -> Option<String> {
        self.machine.lock().last_error().map(str::to_string)
    }

    pub fn status(&self) -> StatusPayload {
        let (state, session_id) = {
            let machine = self.machine.lock();
            (machine.state(), machine.session_id().map(str::to_string))
        };
        let is_master = session_id
            .as_deref()
            .map(|s| self.coordinator.is_master(s))
            .unwrap_or(false);

        StatusPayload {
            state,
            session_id,
            is_synchronized: self.engine.is_synchronized(self.sync_tolerance_ms),
            clock_offset: self.engine.clock_offset(),
            sync_quality: self.engine.sync_quality(),
            connection_type: self.engine.connection_type(),
            is_master,
            last_timing_error: self.coordinator.last_timing_error(),
        }
    }

    /// Run a controller command and build the reply payload
    /// (COMMAND_ACK, STATUS_RESPONSE or ERROR)
    pub fn execute(
        self: &Arc<Self>,
        command: &CommandPayload,
        requested_by: &str,
        channel: &ChannelHandle,
    ) -> Payload {
        debug!("Executing {} from {}", command.command, requested_by);

        let result = match command.command {
            DeviceCommand::Status => return Payload::StatusResponse(self.status()),
            DeviceCommand::Prepare => self
                .prepare(command.session_id.clone(), Some(channel))
                .map(|session| format!("Prepared session {}", session)),
            DeviceCommand::Start => match command.start_time() {
                Some(start_time) => self
                    .schedule_start(command.session_id.clone(), start_time, requested_by, channel)
                    .map(|delay| format!("Start scheduled at {} (in {}ms)", start_time, delay)),
                None => self
                    .start_recording(command.session_id.clone(), None, Some(channel))
                    .map(|session| format!("Recording session {}", session)),
            },
            DeviceCommand::Stop => self
                .stop_recording(Some(channel))
                .map(|session| format!("Stopped session {}", session)),
            DeviceCommand::Reset => Ok(format!("Reset to {}", self.reset(Some(channel)))),
        };

        match result {
            Ok(message) => Payload::CommandAck(CommandAckPayload {
                command: command.command,
                success: true,
                state: self.state(),
                message: Some(message),
            }),
            Err(e) => {
                warn!("{} failed: {}", command.command, e);
                Payload::Error(e.to_payload().with_detail("command", command.command.as_str()))
            }
        }
    }

    /// IDLE -> PREPARING -> READY
    pub fn prepare(
        &self,
        session_id: Option<String>,
        channel: Option<&ChannelHandle>,
    ) -> Result<String, CommandError> {
        let _transition = self.transition.lock();
        let session_id = session_id.unwrap_or_else(|| self.new_session_id());
        self.machine.lock().begin_prepare(Some(session_id.clone()))?;

        if let Err(e) = self.invoke(|h| h.on_prepare_requested(Some(&session_id))) {
            return Err(self.fail(e, Some(&session_id), channel));
        }

        self.machine.lock().complete_prepare();
        self.coordinator.create_session_marker(
            channel,
            &session_id,
            MarkerType::TimeReference,
            marker_data(&[("event", "PREPARE".to_string())]),
        );
        self.handlers.status(&format!("Ready for session {}", session_id));
        Ok(session_id)
    }

    /// READY/IDLE -> RECORDING. Without an explicit timestamp the start is
    /// stamped with the synchronized clock.
    pub fn start_recording(
        &self,
        session_id: Option<String>,
        start_timestamp: Option<i64>,
        channel: Option<&ChannelHandle>,
    ) -> Result<String, CommandError> {
        let _transition = self.transition.lock();
        let session_id = {
            let machine = self.machine.lock();
            machine.begin_start()?;
            let prepared = (machine.state() == DeviceState::Ready)
                .then(|| machine.session_id().map(str::to_string))
                .flatten();
            session_id
                .or(prepared)
                .unwrap_or_else(|| self.new_session_id())
        };
        let start_timestamp = start_timestamp.unwrap_or_else(|| self.engine.synchronized_timestamp());

        if let Err(e) = self.invoke(|h| h.on_recording_start_requested(&session_id, start_timestamp)) {
            return Err(self.fail(e, Some(&session_id), channel));
        }

        self.machine.lock().complete_start(Some(session_id.clone()));
        self.coordinator.create_session_marker(
            channel,
            &session_id,
            MarkerType::SessionStart,
            marker_data(&[("startTimestamp", start_timestamp.to_string())]),
        );
        self.handlers
            .status(&format!("Recording started for session {}", session_id));
        Ok(session_id)
    }

    /// Validate a start now and run it at `start_time` on the synchronized clock
    pub fn schedule_start(
        self: &Arc<Self>,
        session_id: Option<String>,
        start_time: i64,
        master_id: &str,
        channel: &ChannelHandle,
    ) -> Result<i64, CommandError> {
        let session_id = {
            let machine = self.machine.lock();
            machine.begin_start()?;
            session_id
                .or_else(|| machine.session_id().map(str::to_string))
                .unwrap_or_else(|| self.new_session_id())
        };

        let payload = CoordinatedStartPayload {
            session_id,
            start_time,
            master_id: master_id.to_string(),
        };
        let controller = Arc::clone(self);
        let channel = channel.clone();
        let delay = self
            .coordinator
            .handle_coordinated_start(&payload, move |fired| {
                controller.run_scheduled_start(fired, &channel)
            })?;
        Ok(delay)
    }

    /// Coordinate a multi-device start. As master the start is broadcast and
    /// scheduled here too; otherwise the request goes to the controller.
    pub fn coordinate_start(
        self: &Arc<Self>,
        session_id: &str,
        start_time: Option<i64>,
        channel: &ChannelHandle,
    ) -> Result<StartOutcome, CommandError> {
        if self.coordinator.is_master(session_id) {
            self.machine.lock().begin_start()?;
        }

        let controller = Arc::clone(self);
        let on_start_channel = channel.clone();
        let outcome = self.coordinator.coordinate_multi_device_start(
            channel,
            session_id,
            start_time,
            move |fired| controller.run_scheduled_start(fired, &on_start_channel),
        )?;
        Ok(outcome)
    }

    /// Start action for a coordinated start that just fired
    pub fn run_scheduled_start(&self, fired: FiredStart, channel: &ChannelHandle) {
        let session_id = fired.session_id.clone();
        if let Err(e) = self.start_recording(Some(fired.session_id), Some(fired.scheduled_start), Some(channel)) {
            self.handlers
                .status(&format!("Scheduled start for {} failed: {}", session_id, e));
            let error = e.to_payload().with_detail("sessionId", session_id.clone());
            if let Err(send_err) = channel.send_payload(Payload::Error(error), Some(session_id)) {
                debug!("Could not report scheduled start failure: {}", send_err);
            }
        }
    }

    /// RECORDING -> STOPPING -> IDLE
    pub fn stop_recording(&self, channel: Option<&ChannelHandle>) -> Result<String, CommandError> {
        let _transition = self.transition.lock();
        let session_id = {
            let mut machine = self.machine.lock();
            machine.begin_stop()?;
            machine.session_id().unwrap_or_default().to_string()
        };

        if let Err(e) = self.invoke(|h| h.on_recording_stop_requested(&session_id)) {
            return Err(self.fail(e, Some(&session_id), channel));
        }

        self.machine.lock().complete_stop();
        self.coordinator.create_session_marker(
            channel,
            &session_id,
            MarkerType::SessionEnd,
            BTreeMap::new(),
        );
        self.handlers
            .status(&format!("Recording stopped for session {}", session_id));
        Ok(session_id)
    }

    /// Any -> IDLE. Cancels a pending coordinated start and stops an active
    /// recording (best effort).
    pub fn reset(&self, channel: Option<&ChannelHandle>) -> DeviceState {
        let _transition = self.transition.lock();
        self.coordinator.cancel_scheduled_start("reset");

        let (previous, session_id) = {
            let machine = self.machine.lock();
            (machine.state(), machine.session_id().map(str::to_string))
        };

        if previous == DeviceState::Recording {
            if let Some(session_id) = &session_id {
                if let Err(e) = self.invoke(|h| h.on_recording_stop_requested(session_id)) {
                    warn!("Stop during reset failed: {}", e);
                }
            }
        }

        self.machine.lock().reset();

        if let Some(session_id) = &session_id {
            self.coordinator.create_session_marker(
                channel,
                session_id,
                MarkerType::Custom,
                marker_data(&[
                    ("event", "RESET".to_string()),
                    ("previousState", previous.to_string()),
                ]),
            );
        }
        self.handlers
            .status(&format!("Device reset (was {})", previous));
        DeviceState::Idle
    }

    fn invoke(
        &self,
        call: impl FnOnce(&dyn RecordingHandler) -> Result<(), HandlerError>,
    ) -> Result<(), HandlerError> {
        match self.handlers.recording_handler() {
            Some(handler) => call(handler.as_ref()),
            None => {
                debug!("No recording handler registered");
                Ok(())
            }
        }
    }

    fn fail(
        &self,
        error: HandlerError,
        session_id: Option<&str>,
        channel: Option<&ChannelHandle>,
    ) -> CommandError {
        self.machine.lock().fail(error.0.clone());
        if let Some(session_id) = session_id {
            self.coordinator.create_session_marker(
                channel,
                session_id,
                MarkerType::Custom,
                marker_data(&[("event", "ERROR".to_string()), ("reason", error.0.clone())]),
            );
        }
        self.handlers.status(&format!("Device error: {}", error));
        CommandError::Hardware(error)
    }

    fn new_session_id(&self) -> String {
        format!("session-{}", self.engine.synchronized_timestamp())
    }
}

fn marker_data(entries: &[(&str, String)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MonotonicClock, SharedClock};
    use crate::device::handler::testing::{Call, RecordingSpy, StatusLog};
    use crate::metrics::SharedMetrics;
    use crate::network::ChannelCommand;
    use crate::protocol::EnhancedMessage;
    use crate::sync::{ConnectionType, ReportedTransport};
    use tokio::sync::mpsc;

    struct Fixture {
        controller: Arc<DeviceController>,
        coordinator: Arc<SessionCoordinator>,
        spy: Arc<RecordingSpy>,
        status: Arc<StatusLog>,
        channel: ChannelHandle,
        commands: mpsc::UnboundedReceiver<ChannelCommand>,
        clock: SharedClock,
    }

    fn fixture() -> Fixture {
        let clock: SharedClock = Arc::new(MonotonicClock::anchored_at(5_000_000));
        let engine = Arc::new(SyncEngine::new(
            clock.clone(),
            Arc::new(ReportedTransport::new(ConnectionType::Wifi)),
            SharedMetrics::new(),
        ));
        let coordinator = Arc::new(SessionCoordinator::new("device-a", engine.clone(), 5_000));
        let handlers = Arc::new(HandlerRegistry::new());
        let spy = Arc::new(RecordingSpy::default());
        let status = Arc::new(StatusLog::default());
        handlers.set_recording_handler(spy.clone());
        handlers.add_status_sink(status.clone());

        let controller = Arc::new(DeviceController::new(engine, coordinator.clone(), handlers, 10));
        let (channel, commands) = ChannelHandle::detached("device-a", clock.clone());
        Fixture {
            controller,
            coordinator,
            spy,
            status,
            channel,
            commands,
            clock,
        }
    }

    fn sent(commands: &mut mpsc::UnboundedReceiver<ChannelCommand>) -> Vec<EnhancedMessage> {
        let mut out = Vec::new();
        while let Ok(ChannelCommand::Send(message)) = commands.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_recording_cycle() {
        let mut f = fixture();

        let session = f.controller.prepare(Some("s1".to_string()), Some(&f.channel)).unwrap();
        assert_eq!(session, "s1");
        assert_eq!(f.controller.state(), DeviceState::Ready);

        f.controller.start_recording(None, None, Some(&f.channel)).unwrap();
        assert_eq!(f.controller.state(), DeviceState::Recording);

        f.controller.stop_recording(Some(&f.channel)).unwrap();
        assert_eq!(f.controller.state(), DeviceState::Idle);

        let now = f.clock.now_ms();
        assert_eq!(
            f.spy.calls(),
            vec![
                Call::Prepare(Some("s1".to_string())),
                Call::Start("s1".to_string(), now),
                Call::Stop("s1".to_string()),
            ]
        );

        let kinds: Vec<MarkerType> = f
            .coordinator
            .markers_for_session("s1")
            .iter()
            .map(|m| m.marker_type)
            .collect();
        assert_eq!(
            kinds,
            vec![MarkerType::TimeReference, MarkerType::SessionStart, MarkerType::SessionEnd]
        );
        assert_eq!(sent(&mut f.commands).len(), 3);
    }

    #[tokio::test]
    async fn test_start_while_recording_is_invalid() {
        let f = fixture();
        f.controller.start_recording(Some("s1".to_string()), None, None).unwrap();

        let err = f.controller.start_recording(None, None, None).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidState);
        assert_eq!(f.controller.state(), DeviceState::Recording);
        // The handler only ran for the first start
        assert_eq!(f.spy.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_enters_error() {
        let f = fixture();
        *f.spy.fail_start.lock() = Some("camera busy".to_string());

        let err = f.controller.start_recording(Some("s1".to_string()), None, None).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::HardwareError);
        assert_eq!(f.controller.state(), DeviceState::Error);
        assert_eq!(f.controller.last_error().as_deref(), Some("camera busy"));
        assert!(f.status.0.lock().iter().any(|s| s.contains("camera busy")));

        // Not retried, and nothing but RESET/STATUS works now
        assert!(f.controller.start_recording(None, None, None).is_err());
        assert_eq!(f.spy.calls().len(), 1);

        assert_eq!(f.controller.reset(None), DeviceState::Idle);
        assert_eq!(f.controller.last_error(), None);
    }

    #[tokio::test]
    async fn test_execute_replies() {
        let f = fixture();

        match f.controller.execute(&CommandPayload::new(DeviceCommand::Status), "ctl", &f.channel) {
            Payload::StatusResponse(status) => {
                assert_eq!(status.state, DeviceState::Idle);
                assert!(!status.is_synchronized);
            }
            other => panic!("unexpected {:?}", other),
        }

        match f.controller.execute(&CommandPayload::new(DeviceCommand::Stop), "ctl", &f.channel) {
            Payload::Error(error) => {
                assert_eq!(error.error_code, ErrorCode::InvalidState);
                assert_eq!(error.details["command"], "CMD_STOP");
            }
            other => panic!("unexpected {:?}", other),
        }

        let start = CommandPayload::new(DeviceCommand::Start).with_session("s9");
        match f.controller.execute(&start, "ctl", &f.channel) {
            Payload::CommandAck(ack) => {
                assert!(ack.success);
                assert_eq!(ack.state, DeviceState::Recording);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_start_time_is_deferred() {
        let f = fixture();
        let start_time = f.clock.now_ms() + 5_000;
        let command = CommandPayload::new(DeviceCommand::Start)
            .with_session("s1")
            .with_parameter("startTime", start_time);

        match f.controller.execute(&command, "ctl", &f.channel) {
            Payload::CommandAck(ack) => assert_eq!(ack.state, DeviceState::Idle),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.spy.calls().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(5_001)).await;
        assert_eq!(f.controller.state(), DeviceState::Recording);
        assert_eq!(f.spy.calls(), vec![Call::Start("s1".to_string(), start_time)]);
        assert_eq!(f.coordinator.last_timing_error(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_start_time_is_rejected() {
        let f = fixture();
        let command = CommandPayload::new(DeviceCommand::Start)
            .with_parameter("startTime", f.clock.now_ms() - 10);

        match f.controller.execute(&command, "ctl", &f.channel) {
            Payload::Error(error) => assert_eq!(error.error_code, ErrorCode::StartTimePassed),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.controller.state(), DeviceState::Idle);
        assert!(f.spy.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_scheduled_start() {
        let f = fixture();
        f.controller
            .schedule_start(Some("s1".to_string()), f.clock.now_ms() + 1_000, "ctl", &f.channel)
            .unwrap();

        f.controller.reset(Some(&f.channel));
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        assert_eq!(f.controller.state(), DeviceState::Idle);
        assert!(f.spy.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_coordinates_own_start() {
        let mut f = fixture();
        f.coordinator.register_as_master_clock(&f.channel, "s1").unwrap();
        f.coordinator
            .handle_master_clock_response(&crate::protocol::MasterClockResponsePayload {
                session_id: "s1".to_string(),
                master_id: "device-a".to_string(),
                confirmed: true,
            });

        let outcome = f.controller.coordinate_start("s1", None, &f.channel).unwrap();
        let start_time = f.clock.now_ms() + 5_000;
        assert_eq!(
            outcome,
            StartOutcome::Scheduled {
                start_time,
                delay_ms: 5_000
            }
        );
        assert!(sent(&mut f.commands)
            .iter()
            .any(|m| matches!(m.payload, Payload::CoordinatedStart(_))));

        tokio::time::sleep(std::time::Duration::from_millis(5_001)).await;
        assert_eq!(f.spy.calls(), vec![Call::Start("s1".to_string(), start_time)]);
    }

    #[tokio::test]
    async fn test_reset_while_recording_stops_capture() {
        let f = fixture();
        f.controller.start_recording(Some("s1".to_string()), Some(1), None).unwrap();
        f.controller.reset(None);

        assert_eq!(
            f.spy.calls(),
            vec![Call::Start("s1".to_string(), 1), Call::Stop("s1".to_string())]
        );
        let last = f.coordinator.markers().pop().unwrap();
        assert_eq!(last.marker_type, MarkerType::Custom);
        assert_eq!(last.data["previousState"], "RECORDING");
    }
}
