//! Capture Core
//!
//! Clock synchronization and command protocol for multi-modal capture
//! devices. A device runs a [`service::CaptureService`]: it answers discovery,
//! accepts one controller over TCP, keeps its clock offset to the controller
//! estimated and executes recording commands at synchronized instants.

pub mod clock;
pub mod config;
pub mod device;
pub mod ffi;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod service;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::CoreConfig;
pub use device::{DeviceCommand, DeviceState, RecordingHandler, StatusSink};
pub use protocol::{EnhancedMessage, Payload};
pub use service::{CaptureContext, CaptureService};
pub use sync::{ConnectionType, SyncEngine};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();

const ID_ALPHABET: &[u8] = b"0123456789abcdef";

/// Random lowercase hex identifier of `len` characters
pub fn random_id(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    let mut id = String::with_capacity(len);
    for _ in 0..len {
        let idx = rng.gen_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[idx] as char);
    }
    id
}
