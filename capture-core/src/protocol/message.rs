//! Wire messages
//!
//! Every frame on the command channel is one JSON object:
//! `{type, payload, timestamp, deviceId, sessionId?, messageId, requiresAck}`.
//! The `type` string is resolved into a [`Payload`] variant once, at decode
//! time, so the rest of the crate only ever matches on the enum.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::device::{DeviceCommand, DeviceState};
use crate::session::SessionMarker;
use crate::sync::ConnectionType;

/// Message type tag as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    CommandAck,
    StatusRequest,
    StatusResponse,
    Ping,
    Pong,
    SyncPing,
    SyncPong,
    SyncMarker,
    MarkerAck,
    Heartbeat,
    HeartbeatAck,
    MasterClockRequest,
    MasterClockResponse,
    StartRequest,
    CoordinatedStart,
    CoordinatedStartAck,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 18] = [
        MessageType::Command,
        MessageType::CommandAck,
        MessageType::StatusRequest,
        MessageType::StatusResponse,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::SyncPing,
        MessageType::SyncPong,
        MessageType::SyncMarker,
        MessageType::MarkerAck,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::MasterClockRequest,
        MessageType::MasterClockResponse,
        MessageType::StartRequest,
        MessageType::CoordinatedStart,
        MessageType::CoordinatedStartAck,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "COMMAND",
            MessageType::CommandAck => "COMMAND_ACK",
            MessageType::StatusRequest => "STATUS_REQUEST",
            MessageType::StatusResponse => "STATUS_RESPONSE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::SyncPing => "SYNC_PING",
            MessageType::SyncPong => "SYNC_PONG",
            MessageType::SyncMarker => "SYNC_MARKER",
            MessageType::MarkerAck => "MARKER_ACK",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::MasterClockRequest => "MASTER_CLOCK_REQUEST",
            MessageType::MasterClockResponse => "MASTER_CLOCK_RESPONSE",
            MessageType::StartRequest => "START_REQUEST",
            MessageType::CoordinatedStart => "COORDINATED_START",
            MessageType::CoordinatedStartAck => "COORDINATED_START_ACK",
            MessageType::Error => "ERROR",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownCommand,
    InvalidState,
    HardwareError,
    NetworkError,
    StartTimePassed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command: DeviceCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CommandPayload {
    pub fn new(command: DeviceCommand) -> Self {
        Self {
            command,
            session_id: None,
            parameters: Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Requested synchronized start instant, if the controller sent one
    pub fn start_time(&self) -> Option<i64> {
        self.parameters.get("startTime").and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAckPayload {
    pub command: DeviceCommand,
    pub success: bool,
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRequestPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_synchronized: bool,
    pub clock_offset: i64,
    pub sync_quality: u8,
    pub connection_type: ConnectionType,
    pub is_master: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timing_error: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub ping_timestamp: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPingPayload {
    pub ping_id: String,
    #[serde(alias = "clientSendTime")]
    pub client_timestamp: i64,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPongPayload {
    pub ping_id: String,
    pub client_timestamp: i64,
    pub server_receive_timestamp: i64,
    pub server_send_timestamp: i64,
    #[serde(default)]
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerAckPayload {
    pub marker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub state: DeviceState,
    pub is_synchronized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterClockRequestPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterClockResponsePayload {
    pub session_id: String,
    pub master_id: String,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequestPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_start_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatedStartPayload {
    pub session_id: String,
    pub start_time: i64,
    pub master_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatedStartAckPayload {
    pub session_id: String,
    pub scheduled_start: i64,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_code: ErrorCode,
    pub error_message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ErrorPayload {
    pub fn new(error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Typed message body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandPayload),
    CommandAck(CommandAckPayload),
    StatusRequest(StatusRequestPayload),
    StatusResponse(StatusPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    SyncPing(SyncPingPayload),
    SyncPong(SyncPongPayload),
    SyncMarker(SessionMarker),
    MarkerAck(MarkerAckPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    MasterClockRequest(MasterClockRequestPayload),
    MasterClockResponse(MasterClockResponsePayload),
    StartRequest(StartRequestPayload),
    CoordinatedStart(CoordinatedStartPayload),
    CoordinatedStartAck(CoordinatedStartAckPayload),
    Error(ErrorPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Command(_) => MessageType::Command,
            Payload::CommandAck(_) => MessageType::CommandAck,
            Payload::StatusRequest(_) => MessageType::StatusRequest,
            Payload::StatusResponse(_) => MessageType::StatusResponse,
            Payload::Ping(_) => MessageType::Ping,
            Payload::Pong(_) => MessageType::Pong,
            Payload::SyncPing(_) => MessageType::SyncPing,
            Payload::SyncPong(_) => MessageType::SyncPong,
            Payload::SyncMarker(_) => MessageType::SyncMarker,
            Payload::MarkerAck(_) => MessageType::MarkerAck,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Payload::MasterClockRequest(_) => MessageType::MasterClockRequest,
            Payload::MasterClockResponse(_) => MessageType::MasterClockResponse,
            Payload::StartRequest(_) => MessageType::StartRequest,
            Payload::CoordinatedStart(_) => MessageType::CoordinatedStart,
            Payload::CoordinatedStartAck(_) => MessageType::CoordinatedStartAck,
            Payload::Error(_) => MessageType::Error,
        }
    }

    /// Whether the receiver is expected to acknowledge this message
    pub fn default_requires_ack(&self) -> bool {
        matches!(
            self,
            Payload::Command(_)
                | Payload::SyncMarker(_)
                | Payload::MasterClockRequest(_)
                | Payload::CoordinatedStart(_)
        )
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Command(p) => serde_json::to_value(p),
            Payload::CommandAck(p) => serde_json::to_value(p),
            Payload::StatusRequest(p) => serde_json::to_value(p),
            Payload::StatusResponse(p) => serde_json::to_value(p),
            Payload::Ping(p) => serde_json::to_value(p),
            Payload::Pong(p) => serde_json::to_value(p),
            Payload::SyncPing(p) => serde_json::to_value(p),
            Payload::SyncPong(p) => serde_json::to_value(p),
            Payload::SyncMarker(p) => serde_json::to_value(p),
            Payload::MarkerAck(p) => serde_json::to_value(p),
            Payload::Heartbeat(p) => serde_json::to_value(p),
            Payload::HeartbeatAck(p) => serde_json::to_value(p),
            Payload::MasterClockRequest(p) => serde_json::to_value(p),
            Payload::MasterClockResponse(p) => serde_json::to_value(p),
            Payload::StartRequest(p) => serde_json::to_value(p),
            Payload::CoordinatedStart(p) => serde_json::to_value(p),
            Payload::CoordinatedStartAck(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
        }
    }

    fn from_value(message_type: MessageType, value: Value) -> Result<Self, serde_json::Error> {
        // A missing payload is treated as an empty object
        let value = match value {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        Ok(match message_type {
            MessageType::Command => Payload::Command(serde_json::from_value(value)?),
            MessageType::CommandAck => Payload::CommandAck(serde_json::from_value(value)?),
            MessageType::StatusRequest => Payload::StatusRequest(serde_json::from_value(value)?),
            MessageType::StatusResponse => Payload::StatusResponse(serde_json::from_value(value)?),
            MessageType::Ping => Payload::Ping(serde_json::from_value(value)?),
            MessageType::Pong => Payload::Pong(serde_json::from_value(value)?),
            MessageType::SyncPing => Payload::SyncPing(serde_json::from_value(value)?),
            MessageType::SyncPong => Payload::SyncPong(serde_json::from_value(value)?),
            MessageType::SyncMarker => Payload::SyncMarker(serde_json::from_value(value)?),
            MessageType::MarkerAck => Payload::MarkerAck(serde_json::from_value(value)?),
            MessageType::Heartbeat => Payload::Heartbeat(serde_json::from_value(value)?),
            MessageType::HeartbeatAck => Payload::HeartbeatAck(serde_json::from_value(value)?),
            MessageType::MasterClockRequest => {
                Payload::MasterClockRequest(serde_json::from_value(value)?)
            }
            MessageType::MasterClockResponse => {
                Payload::MasterClockResponse(serde_json::from_value(value)?)
            }
            MessageType::StartRequest => Payload::StartRequest(serde_json::from_value(value)?),
            MessageType::CoordinatedStart => {
                Payload::CoordinatedStart(serde_json::from_value(value)?)
            }
            MessageType::CoordinatedStartAck => {
                Payload::CoordinatedStartAck(serde_json::from_value(value)?)
            }
            MessageType::Error => Payload::Error(serde_json::from_value(value)?),
        })
    }
}

/// Errors produced while turning a frame into an [`EnhancedMessage`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("Unknown message type: {type_name}")]
    UnknownType {
        type_name: String,
        message_id: Option<String>,
    },

    #[error("Unknown command: {command}")]
    UnknownCommand {
        command: String,
        message_id: Option<String>,
    },

    #[error("Invalid {message_type:?} payload: {source}")]
    InvalidPayload {
        message_type: MessageType,
        message_id: Option<String>,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Message id of the offending frame, when it could be read
    pub fn message_id(&self) -> Option<&str> {
        match self {
            DecodeError::Malformed(_)
            | DecodeError::InvalidUtf8(_)
            | DecodeError::FrameTooLong { .. } => None,
            DecodeError::UnknownType { message_id, .. }
            | DecodeError::UnknownCommand { message_id, .. }
            | DecodeError::InvalidPayload { message_id, .. } => message_id.as_deref(),
        }
    }

    /// Wire error code reported back to the sender
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DecodeError::UnknownType { .. } | DecodeError::UnknownCommand { .. } => {
                ErrorCode::UnknownCommand
            }
            DecodeError::Malformed(_)
            | DecodeError::InvalidUtf8(_)
            | DecodeError::FrameTooLong { .. }
            | DecodeError::InvalidPayload { .. } => ErrorCode::NetworkError,
        }
    }
}

/// Raw envelope as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    requires_ack: bool,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedMessage {
    pub payload: Payload,
    pub timestamp: i64,
    pub device_id: String,
    pub session_id: Option<String>,
    pub message_id: String,
    pub requires_ack: bool,
}

impl EnhancedMessage {
    /// Create a message with a fresh id
    pub fn new(payload: Payload, device_id: impl Into<String>, timestamp: i64) -> Self {
        let requires_ack = payload.default_requires_ack();
        Self {
            payload,
            timestamp,
            device_id: device_id.into(),
            session_id: None,
            message_id: crate::random_id(16),
            requires_ack,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn requiring_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Serialize to a single JSON line (without the trailing newline)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let envelope = WireEnvelope {
            kind: self.message_type().as_str().to_string(),
            payload: self.payload.to_value()?,
            timestamp: self.timestamp,
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            requires_ack: self.requires_ack,
        };
        serde_json::to_string(&envelope)
    }

    /// Parse one raw frame as read off the socket
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(frame).map_err(DecodeError::InvalidUtf8)?;
        Self::decode(text)
    }

    /// Parse one frame
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let envelope: WireEnvelope =
            serde_json::from_str(frame.trim()).map_err(DecodeError::Malformed)?;

        let message_id = (!envelope.message_id.is_empty()).then(|| envelope.message_id.clone());

        let message_type = MessageType::parse(&envelope.kind).ok_or_else(|| DecodeError::UnknownType {
            type_name: envelope.kind.clone(),
            message_id: message_id.clone(),
        })?;

        if message_type == MessageType::Command {
            if let Some(command) = envelope.payload.get("command").and_then(Value::as_str) {
                if DeviceCommand::parse(command).is_none() {
                    return Err(DecodeError::UnknownCommand {
                        command: command.to_string(),
                        message_id,
                    });
                }
            }
        }

        let payload = Payload::from_value(message_type, envelope.payload).map_err(|source| {
            DecodeError::InvalidPayload {
                message_type,
                message_id: message_id.clone(),
                source,
            }
        })?;

        Ok(Self {
            payload,
            timestamp: envelope.timestamp,
            device_id: envelope.device_id,
            session_id: envelope.session_id,
            message_id: envelope.message_id,
            requires_ack: envelope.requires_ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MarkerType;
    use std::collections::BTreeMap;

    fn round_trip(payload: Payload) {
        let message = EnhancedMessage::new(payload, "device-1", 1_700_000_000_123)
            .with_session(Some("session-9".to_string()));
        let line = message.encode().unwrap();
        assert!(!line.contains('\n'));

        let decoded = EnhancedMessage::decode(&line).unwrap();
        assert_eq!(decoded, message);
    }

    fn sample_payloads() -> Vec<Payload> {
        let mut data = BTreeMap::new();
        data.insert("note".to_string(), "calibration board".to_string());

        vec![
            Payload::Command(
                CommandPayload::new(DeviceCommand::Start)
                    .with_session("s1")
                    .with_parameter("startTime", 1_700_000_005_000i64),
            ),
            Payload::CommandAck(CommandAckPayload {
                command: DeviceCommand::Stop,
                success: true,
                state: DeviceState::Idle,
                message: Some("stopped".to_string()),
            }),
            Payload::StatusRequest(StatusRequestPayload {}),
            Payload::StatusResponse(StatusPayload {
                state: DeviceState::Recording,
                session_id: Some("s1".to_string()),
                is_synchronized: true,
                clock_offset: -12,
                sync_quality: 80,
                connection_type: ConnectionType::Wifi,
                is_master: false,
                last_timing_error: Some(1),
            }),
            Payload::Ping(PingPayload { timestamp: 5 }),
            Payload::Pong(PongPayload {
                ping_timestamp: 5,
                timestamp: 9,
            }),
            Payload::SyncPing(SyncPingPayload {
                ping_id: "p-1".to_string(),
                client_timestamp: 1_700_000_000_000,
                sequence_number: 42,
            }),
            Payload::SyncPong(SyncPongPayload {
                ping_id: "p-1".to_string(),
                client_timestamp: 1_700_000_000_000,
                server_receive_timestamp: 1_700_000_000_050,
                server_send_timestamp: 1_700_000_000_051,
                sequence_number: 42,
            }),
            Payload::SyncMarker(SessionMarker {
                marker_id: "m-1".to_string(),
                marker_type: MarkerType::Calibration,
                session_id: "s1".to_string(),
                timestamp: i64::MAX,
                data,
            }),
            Payload::MarkerAck(MarkerAckPayload {
                marker_id: "m-1".to_string(),
            }),
            Payload::Heartbeat(HeartbeatPayload {
                state: DeviceState::Ready,
                is_synchronized: false,
            }),
            Payload::HeartbeatAck(HeartbeatAckPayload {}),
            Payload::MasterClockRequest(MasterClockRequestPayload {
                session_id: "s1".to_string(),
            }),
            Payload::MasterClockResponse(MasterClockResponsePayload {
                session_id: "s1".to_string(),
                master_id: "device-1".to_string(),
                confirmed: true,
            }),
            Payload::StartRequest(StartRequestPayload {
                session_id: "s1".to_string(),
                requested_start_time: None,
            }),
            Payload::CoordinatedStart(CoordinatedStartPayload {
                session_id: "s1".to_string(),
                start_time: 1_700_000_005_000,
                master_id: "device-1".to_string(),
            }),
            Payload::CoordinatedStartAck(CoordinatedStartAckPayload {
                session_id: "s1".to_string(),
                scheduled_start: 1_700_000_005_000,
                accepted: true,
            }),
            Payload::Error(
                ErrorPayload::new(ErrorCode::StartTimePassed, "too late").with_detail("lateByMs", 12),
            ),
        ]
    }

    #[test]
    fn test_every_type_round_trips() {
        let payloads = sample_payloads();
        assert_eq!(payloads.len(), MessageType::ALL.len());
        for payload in payloads {
            round_trip(payload);
        }
    }

    #[test]
    fn test_sync_ping_wire_format() {
        let message = EnhancedMessage::new(
            Payload::SyncPing(SyncPingPayload {
                ping_id: "abc".to_string(),
                client_timestamp: 1_700_000_000_000,
                sequence_number: 42,
            }),
            "device-1",
            1_700_000_000_000,
        );
        assert!(!message.requires_ack);

        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "SYNC_PING");
        assert_eq!(value["payload"]["sequenceNumber"], 42);
        assert_eq!(value["payload"]["clientTimestamp"], 1_700_000_000_000i64);
        assert_eq!(value["deviceId"], "device-1");
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn test_decode_controller_frame() {
        let frame = r#"{"type":"COMMAND","payload":{"command":"CMD_PREPARE","sessionId":"s-7","parameters":{}},"timestamp":17,"deviceId":"pc","messageId":"m-1","requiresAck":true}"#;
        let message = EnhancedMessage::decode(frame).unwrap();

        assert_eq!(message.message_id, "m-1");
        assert!(message.requires_ack);
        match message.payload {
            Payload::Command(cmd) => {
                assert_eq!(cmd.command, DeviceCommand::Prepare);
                assert_eq!(cmd.session_id.as_deref(), Some("s-7"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_client_send_time_alias() {
        let frame = r#"{"type":"SYNC_PING","payload":{"pingId":"x","clientSendTime":99,"sequenceNumber":1},"messageId":"m"}"#;
        let message = EnhancedMessage::decode(frame).unwrap();
        match message.payload {
            Payload::SyncPing(ping) => assert_eq!(ping.client_timestamp, 99),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload_for_empty_types() {
        let message = EnhancedMessage::decode(r#"{"type":"HEARTBEAT_ACK","messageId":"h"}"#).unwrap();
        assert_eq!(message.payload, Payload::HeartbeatAck(HeartbeatAckPayload {}));
    }

    #[test]
    fn test_malformed_json() {
        let err = EnhancedMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert_eq!(err.error_code(), ErrorCode::NetworkError);
        assert_eq!(err.message_id(), None);
    }

    #[test]
    fn test_invalid_utf8_is_a_network_error() {
        let err = EnhancedMessage::decode_bytes(b"{\"type\":\"PING\",\xff\xfe}").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
        assert_eq!(err.error_code(), ErrorCode::NetworkError);

        let frame = EnhancedMessage::new(Payload::Ping(PingPayload { timestamp: 7 }), "pc", 1)
            .encode()
            .unwrap();
        let decoded = EnhancedMessage::decode_bytes(frame.as_bytes()).unwrap();
        assert_eq!(decoded.payload, Payload::Ping(PingPayload { timestamp: 7 }));
    }

    #[test]
    fn test_unknown_type_keeps_message_id() {
        let err = EnhancedMessage::decode(r#"{"type":"TELEPORT","payload":{},"messageId":"m-42"}"#)
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::UnknownCommand);
        assert_eq!(err.message_id(), Some("m-42"));
    }

    #[test]
    fn test_unknown_command() {
        let err = EnhancedMessage::decode(
            r#"{"type":"COMMAND","payload":{"command":"CMD_SELF_DESTRUCT"},"messageId":"m-5"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCommand { .. }));
        assert_eq!(err.error_code(), ErrorCode::UnknownCommand);
        assert_eq!(err.message_id(), Some("m-5"));
    }

    #[test]
    fn test_invalid_payload() {
        let err = EnhancedMessage::decode(r#"{"type":"SYNC_PONG","payload":{"pingId":7},"messageId":"q"}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
        assert_eq!(err.error_code(), ErrorCode::NetworkError);
    }

    #[test]
    fn test_start_time_parameter() {
        let cmd = CommandPayload::new(DeviceCommand::Start).with_parameter("startTime", 1234i64);
        assert_eq!(cmd.start_time(), Some(1234));
        assert_eq!(CommandPayload::new(DeviceCommand::Start).start_time(), None);
    }
}
