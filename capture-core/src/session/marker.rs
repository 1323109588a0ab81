//! Session markers
//!
//! Markers are synchronized timestamps tagged with what happened (session
//! start, calibration, ...). They are sent to the controller and kept in a
//! bounded local log so the timeline can be verified afterwards.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of markers kept in the local log
pub const MAX_MARKER_LOG: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerType {
    SessionStart,
    SessionEnd,
    Calibration,
    TimeReference,
    Custom,
}

impl fmt::Display for MarkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarkerType::SessionStart => "SESSION_START",
            MarkerType::SessionEnd => "SESSION_END",
            MarkerType::Calibration => "CALIBRATION",
            MarkerType::TimeReference => "TIME_REFERENCE",
            MarkerType::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

/// A timestamped event in a recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMarker {
    pub marker_id: String,
    pub marker_type: MarkerType,
    pub session_id: String,
    /// Synchronized timestamp (ms)
    pub timestamp: i64,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl SessionMarker {
    pub fn new(
        session_id: impl Into<String>,
        marker_type: MarkerType,
        timestamp: i64,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            marker_id: format!("marker-{}-{}", timestamp, crate::random_id(6)),
            marker_type,
            session_id: session_id.into(),
            timestamp,
            data,
        }
    }
}

/// Append-only marker log keeping the most recent entries
#[derive(Debug)]
pub struct MarkerLog {
    markers: VecDeque<SessionMarker>,
    capacity: usize,
}

impl MarkerLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MARKER_LOG)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            markers: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, marker: SessionMarker) {
        if self.markers.len() >= self.capacity {
            self.markers.pop_front();
        }
        self.markers.push_back(marker);
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn last(&self) -> Option<&SessionMarker> {
        self.markers.back()
    }

    /// Markers belonging to one session, oldest first
    pub fn for_session<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = &'a SessionMarker> + 'a {
        self.markers.iter().filter(move |m| m.session_id == session_id)
    }

    /// Copy of the whole log, oldest first
    pub fn snapshot(&self) -> Vec<SessionMarker> {
        self.markers.iter().cloned().collect()
    }
}

impl Default for MarkerLog {
    fn default() -> Self {
        Self::new()
    }
}
