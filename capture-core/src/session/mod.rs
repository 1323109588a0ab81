//! Recording sessions
//!
//! Session markers and multi-device start coordination.

mod coordinator;
mod marker;

pub use coordinator::{
    ClockRole, CoordinationError, FiredStart, PendingStartInfo, SessionCoordinator, StartOutcome,
    TimingRecord,
};
pub use marker::{MarkerLog, MarkerType, SessionMarker, MAX_MARKER_LOG};
