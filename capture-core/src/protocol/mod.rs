//! Wire protocol
//!
//! JSON envelopes for the command channel, discovery datagrams and sensor
//! data packets.

mod data;
mod discovery;
mod message;

pub use data::{DataKind, DataPacket};
pub use discovery::{is_discovery_request, DiscoveryResponse, DISCOVERY_REQUEST};
pub use message::*;
