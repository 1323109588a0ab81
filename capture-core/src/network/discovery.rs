//! UDP discovery
//!
//! Devices listen on the discovery port and answer the controller's
//! broadcast with their identity and command port.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::metrics::SharedMetrics;
use crate::protocol::{is_discovery_request, DiscoveryResponse, DISCOVERY_REQUEST};

const MAX_DATAGRAM: usize = 2048;

/// Builds the answer to a discovery request
#[derive(Clone)]
pub struct DiscoveryResponder {
    device_id: String,
    device_name: String,
    server_port: u16,
    capabilities: Vec<String>,
    clock: SharedClock,
    metrics: SharedMetrics,
}

impl DiscoveryResponder {
    pub fn new(config: &CoreConfig, clock: SharedClock, metrics: SharedMetrics) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
            server_port: config.server_port,
            capabilities: config.capabilities.clone(),
            clock,
            metrics,
        }
    }

    /// Advertise a different command port (e.g. the one actually bound)
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn response(&self) -> DiscoveryResponse {
        DiscoveryResponse::new(
            self.device_id.clone(),
            self.device_name.clone(),
            self.server_port,
            self.capabilities.clone(),
            self.clock.now_ms(),
        )
    }

    /// Answer datagrams until shutdown
    pub async fn run(self, socket: UdpSocket, mut shutdown_rx: watch::Receiver<bool>, io_timeout: Duration) {
        if let Ok(addr) = socket.local_addr() {
            info!("Discovery listener on {}", addr);
        }
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                received = tokio::time::timeout(io_timeout, socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue,
                        Ok(Ok((len, from))) => {
                            if !is_discovery_request(&buf[..len]) {
                                debug!("Ignoring {} byte datagram from {}", len, from);
                                continue;
                            }
                            self.answer(&socket, from).await;
                        }
                        Ok(Err(e)) => {
                            warn!("Discovery receive failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("Discovery listener stopped");
    }

    async fn answer(&self, socket: &UdpSocket, to: SocketAddr) {
        let bytes = match serde_json::to_vec(&self.response()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode discovery response: {}", e);
                return;
            }
        };
        match socket.send_to(&bytes, to).await {
            Ok(_) => {
                debug!("Answered discovery from {}", to);
                self.metrics.update(|m| m.discovery_responses += 1);
            }
            Err(e) => warn!("Failed to answer discovery from {}: {}", to, e),
        }
    }
}

/// Bind the discovery port with broadcast enabled
pub async fn bind_discovery_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// A device that answered discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Command channel address (responder IP + advertised port)
    pub address: SocketAddr,
    pub response: DiscoveryResponse,
}

/// Broadcast a discovery request and collect answers for `wait`
pub async fn discover_devices(discovery_port: u16, wait: Duration) -> std::io::Result<Vec<DiscoveredDevice>> {
    discover_at(SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port)), wait).await
}

/// Send a discovery request to `target` and collect answers for `wait`
pub async fn discover_at(target: SocketAddr, wait: Duration) -> std::io::Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_REQUEST.as_bytes(), target).await?;

    let deadline = tokio::time::Instant::now() + wait;
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(received) => received,
        };
        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                warn!("Discovery receive failed: {}", e);
                continue;
            }
        };
        let Some(response) = DiscoveryResponse::parse(&buf[..len]) else {
            debug!("Ignoring non-discovery datagram from {}", from);
            continue;
        };
        if devices.iter().any(|d| d.response.device_id == response.device_id) {
            continue;
        }
        info!("Discovered {} ({}) at {}", response.device_name, response.device_id, from.ip());
        devices.push(DiscoveredDevice {
            address: SocketAddr::new(from.ip(), response.server_port),
            response,
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_discovery_round_trip() {
        let config = CoreConfig::default().with_device("android-test", "Test Phone");
        let metrics = SharedMetrics::new();
        let responder = DiscoveryResponder::new(&config, Arc::new(ManualClock::new(42)), metrics.clone())
            .with_server_port(9999);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(responder.run(socket, shutdown_rx, Duration::from_millis(200)));

        let devices = discover_at(addr, Duration::from_millis(500)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].response.device_id, "android-test");
        assert_eq!(devices[0].response.timestamp, 42);
        assert_eq!(devices[0].address, SocketAddr::from(([127, 0, 0, 1], 9999)));
        assert_eq!(metrics.snapshot().discovery_responses, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_datagrams_are_ignored() {
        let config = CoreConfig::default();
        let responder = DiscoveryResponder::new(&config, Arc::new(ManualClock::new(0)), SharedMetrics::new());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(socket, shutdown_rx, Duration::from_millis(200)));

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"HELLO", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let reply = tokio::time::timeout(Duration::from_millis(300), stranger.recv_from(&mut buf)).await;
        assert!(reply.is_err());

        let _ = shutdown_tx.send(true);
    }
}
