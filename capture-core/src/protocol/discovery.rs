//! Discovery wire format
//!
//! The controller broadcasts the plain string [`DISCOVERY_REQUEST`] on UDP.
//! Devices answer with a JSON [`DiscoveryResponse`].

use serde::{Deserialize, Serialize};

pub const DISCOVERY_REQUEST: &str = "DISCOVER_ANDROID_CAPTURE";

const DISCOVERY_RESPONSE_TYPE: &str = "DISCOVERY_RESPONSE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub device_name: String,
    pub server_port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub timestamp: i64,
}

impl DiscoveryResponse {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        server_port: u16,
        capabilities: Vec<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: DISCOVERY_RESPONSE_TYPE.to_string(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            server_port,
            capabilities,
            timestamp,
        }
    }

    /// Parse a datagram, rejecting anything that is not a discovery response
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let response: Self = serde_json::from_slice(datagram).ok()?;
        (response.kind == DISCOVERY_RESPONSE_TYPE).then_some(response)
    }
}

/// Whether a datagram is a discovery request
pub fn is_discovery_request(datagram: &[u8]) -> bool {
    std::str::from_utf8(datagram)
        .map(|s| s.trim() == DISCOVERY_REQUEST)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_matching() {
        assert!(is_discovery_request(b"DISCOVER_ANDROID_CAPTURE"));
        assert!(is_discovery_request(b"DISCOVER_ANDROID_CAPTURE\n"));
        assert!(!is_discovery_request(b"DISCOVER_SOMETHING_ELSE"));
        assert!(!is_discovery_request(&[0xff, 0xfe]));
    }

    #[test]
    fn test_response_shape() {
        let response = DiscoveryResponse::new("android-1", "Pixel", 8888, vec!["GSR".to_string()], 99);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "DISCOVERY_RESPONSE");
        assert_eq!(json["deviceId"], "android-1");
        assert_eq!(json["serverPort"], 8888);
        assert_eq!(json["capabilities"][0], "GSR");

        let bytes = serde_json::to_vec(&response).unwrap();
        assert_eq!(DiscoveryResponse::parse(&bytes), Some(response));
    }

    #[test]
    fn test_parse_rejects_other_types() {
        let other = br#"{"type":"HEARTBEAT","deviceId":"x","deviceName":"y","serverPort":1,"timestamp":0}"#;
        assert_eq!(DiscoveryResponse::parse(other), None);
        assert_eq!(DiscoveryResponse::parse(b"garbage"), None);
    }
}
