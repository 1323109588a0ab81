//! Sensor data packets streamed over UDP

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    Gsr,
    ThermalTemp,
    CameraFrame,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataKind::Gsr => "GSR",
            DataKind::ThermalTemp => "THERMAL_TEMP",
            DataKind::CameraFrame => "CAMERA_FRAME",
        };
        f.write_str(name)
    }
}

/// One datagram worth of sensor data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    #[serde(rename = "type")]
    pub kind: DataKind,
    /// Synchronized timestamp of the sample (ms)
    pub timestamp: i64,
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl DataPacket {
    pub fn new(kind: DataKind, timestamp: i64, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            timestamp,
            session_id: session_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(datagram)
    }
}
