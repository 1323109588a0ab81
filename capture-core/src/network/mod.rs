//! Networking
//!
//! TCP command channel, UDP discovery and UDP sensor data streaming.

mod backoff;
mod channel;
mod discovery;
mod streaming;

pub use backoff::RetryPolicy;
pub use channel::{bind_with_retry, ChannelCommand, ChannelError, ChannelEvent, ChannelHandle, ChannelManager};
pub use discovery::{bind_discovery_socket, discover_at, discover_devices, DiscoveredDevice, DiscoveryResponder};
pub use streaming::DataStreamer;
