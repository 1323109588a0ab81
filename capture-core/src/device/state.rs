//! Device State Machine

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    #[default]
    Idle,
    Preparing,
    Ready,
    Recording,
    Stopping,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "IDLE",
            DeviceState::Preparing => "PREPARING",
            DeviceState::Ready => "READY",
            DeviceState::Recording => "RECORDING",
            DeviceState::Stopping => "STOPPING",
            DeviceState::Error => "ERROR",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands the controller can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCommand {
    #[serde(rename = "CMD_START")]
    Start,
    #[serde(rename = "CMD_STOP")]
    Stop,
    #[serde(rename = "CMD_STATUS")]
    Status,
    #[serde(rename = "CMD_PREPARE")]
    Prepare,
    #[serde(rename = "CMD_RESET")]
    Reset,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Start => "CMD_START",
            DeviceCommand::Stop => "CMD_STOP",
            DeviceCommand::Status => "CMD_STATUS",
            DeviceCommand::Prepare => "CMD_PREPARE",
            DeviceCommand::Reset => "CMD_RESET",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CMD_START" => Some(DeviceCommand::Start),
            "CMD_STOP" => Some(DeviceCommand::Stop),
            "CMD_STATUS" => Some(DeviceCommand::Status),
            "CMD_PREPARE" => Some(DeviceCommand::Prepare),
            "CMD_RESET" => Some(DeviceCommand::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command that is not legal in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{command} not allowed while {state}")]
pub struct StateError {
    pub command: DeviceCommand,
    pub state: DeviceState,
}

/// Tracks the device lifecycle and the session it belongs to.
///
/// Transitions are split into `begin_*` (validate and enter the transitional
/// state) and `complete_*` / [`fail`](Self::fail) so the caller can run the
/// external handler in between.
#[derive(Debug, Default)]
pub struct DeviceStateMachine {
    state: DeviceState,
    session_id: Option<String>,
    last_error: Option<String>,
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Check a command against the current state without changing anything
    pub fn validate(&self, command: DeviceCommand) -> Result<(), StateError> {
        let allowed = match command {
            DeviceCommand::Start => matches!(self.state, DeviceState::Ready | DeviceState::Idle),
            DeviceCommand::Stop => self.state == DeviceState::Recording,
            DeviceCommand::Prepare => self.state == DeviceState::Idle,
            DeviceCommand::Status | DeviceCommand::Reset => true,
        };

        if allowed {
            Ok(())
        } else {
            Err(StateError {
                command,
                state: self.state,
            })
        }
    }

    /// IDLE -> PREPARING
    pub fn begin_prepare(&mut self, session_id: Option<String>) -> Result<(), StateError> {
        self.validate(DeviceCommand::Prepare)?;
        self.state = DeviceState::Preparing;
        if session_id.is_some() {
            self.session_id = session_id;
        }
        Ok(())
    }

    /// PREPARING -> READY
    pub fn complete_prepare(&mut self) {
        if self.state == DeviceState::Preparing {
            self.state = DeviceState::Ready;
        }
    }

    /// Validate a start. The state only changes once the handler succeeded.
    pub fn begin_start(&self) -> Result<(), StateError> {
        self.validate(DeviceCommand::Start)
    }

    /// READY/IDLE -> RECORDING
    pub fn complete_start(&mut self, session_id: Option<String>) {
        self.state = DeviceState::Recording;
        if session_id.is_some() {
            self.session_id = session_id;
        }
        self.last_error = None;
    }

    /// RECORDING -> STOPPING
    pub fn begin_stop(&mut self) -> Result<(), StateError> {
        self.validate(DeviceCommand::Stop)?;
        self.state = DeviceState::Stopping;
        Ok(())
    }

    /// STOPPING -> IDLE
    pub fn complete_stop(&mut self) {
        if self.state == DeviceState::Stopping {
            self.state = DeviceState::Idle;
        }
    }

    /// Any -> ERROR
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Device entering ERROR from {}: {}", self.state, reason);
        self.state = DeviceState::Error;
        self.last_error = Some(reason);
    }

    /// Any -> IDLE, clears the session
    pub fn reset(&mut self) {
        self.state = DeviceState::Idle;
        self.session_id = None;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut machine = DeviceStateMachine::new();
        assert_eq!(machine.state(), DeviceState::Idle);

        machine.begin_prepare(Some("s1".to_string())).unwrap();
        assert_eq!(machine.state(), DeviceState::Preparing);
        machine.complete_prepare();
        assert_eq!(machine.state(), DeviceState::Ready);

        machine.begin_start().unwrap();
        machine.complete_start(None);
        assert_eq!(machine.state(), DeviceState::Recording);
        assert_eq!(machine.session_id(), Some("s1"));

        machine.begin_stop().unwrap();
        assert_eq!(machine.state(), DeviceState::Stopping);
        machine.complete_stop();
        assert_eq!(machine.state(), DeviceState::Idle);
    }

    #[test]
    fn test_start_from_idle_allowed() {
        let machine = DeviceStateMachine::new();
        assert!(machine.begin_start().is_ok());
    }

    #[test]
    fn test_start_while_recording_rejected() {
        let mut machine = DeviceStateMachine::new();
        machine.complete_start(Some("s1".to_string()));

        let err = machine.begin_start().unwrap_err();
        assert_eq!(err.state, DeviceState::Recording);
        assert_eq!(err.command, DeviceCommand::Start);
        assert_eq!(machine.state(), DeviceState::Recording);
    }

    #[test]
    fn test_stop_only_from_recording() {
        let mut machine = DeviceStateMachine::new();
        assert!(machine.begin_stop().is_err());
        assert_eq!(machine.state(), DeviceState::Idle);
    }

    #[test]
    fn test_prepare_only_from_idle() {
        let mut machine = DeviceStateMachine::new();
        machine.begin_prepare(None).unwrap();
        machine.complete_prepare();
        assert!(machine.begin_prepare(None).is_err());
        assert_eq!(machine.state(), DeviceState::Ready);
    }

    #[test]
    fn test_reset_from_error() {
        let mut machine = DeviceStateMachine::new();
        machine.fail("camera unavailable");
        assert_eq!(machine.state(), DeviceState::Error);
        assert_eq!(machine.last_error(), Some("camera unavailable"));

        assert!(machine.validate(DeviceCommand::Start).is_err());
        assert!(machine.validate(DeviceCommand::Reset).is_ok());

        machine.reset();
        assert_eq!(machine.state(), DeviceState::Idle);
        assert_eq!(machine.last_error(), None);
    }

    #[test]
    fn test_command_names() {
        for cmd in [
            DeviceCommand::Start,
            DeviceCommand::Stop,
            DeviceCommand::Status,
            DeviceCommand::Prepare,
            DeviceCommand::Reset,
        ] {
            assert_eq!(DeviceCommand::parse(cmd.as_str()), Some(cmd));
            let json = serde_json::to_string(&cmd).unwrap();
            assert_eq!(json, format!("\"{}\"", cmd.as_str()));
        }
        assert_eq!(DeviceCommand::parse("CMD_FLY"), None);
    }
}
