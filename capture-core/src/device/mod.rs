//! Device lifecycle
//!
//! State machine, command execution and the hooks the platform layer
//! registers to do the actual recording.

mod controller;
mod handler;
mod state;

pub use controller::{CommandError, DeviceController};
pub use handler::{HandlerError, HandlerRegistry, RecordingHandler, StatusSink};
pub use state::{DeviceCommand, DeviceState, DeviceStateMachine, StateError};

#[cfg(test)]
pub(crate) use handler::testing;
