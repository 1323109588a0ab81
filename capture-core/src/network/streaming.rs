//! Sensor data streaming
//!
//! Packets are queued on a bounded channel and sent as UDP datagrams by a
//! single sender task. A full queue drops the packet instead of blocking
//! the capture pipeline.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::metrics::SharedMetrics;
use crate::protocol::DataPacket;

#[derive(Clone)]
pub struct DataStreamer {
    tx: mpsc::Sender<DataPacket>,
    target: Arc<RwLock<Option<SocketAddr>>>,
    metrics: SharedMetrics,
}

impl DataStreamer {
    /// Bind an ephemeral UDP socket and spawn the sender task
    pub async fn start(
        capacity: usize,
        metrics: SharedMetrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let target = Arc::new(RwLock::new(None));

        tokio::spawn(run_sender(socket, rx, target.clone(), metrics.clone(), shutdown_rx));

        Ok(Self { tx, target, metrics })
    }

    /// Where packets go; `None` discards them
    pub fn set_target(&self, target: Option<SocketAddr>) {
        match target {
            Some(addr) => debug!("Streaming sensor data to {}", addr),
            None => debug!("Sensor data streaming paused"),
        }
        *self.target.write() = target;
    }

    pub fn target(&self) -> Option<SocketAddr> {
        *self.target.read()
    }

    /// Queue a packet. Returns false if it was dropped.
    pub fn send(&self, packet: DataPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                trace!("Data queue full, dropping {} packet", packet.kind);
                self.metrics.update(|m| m.data_packets_dropped += 1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.update(|m| m.data_packets_dropped += 1);
                false
            }
        }
    }
}

async fn run_sender(
    socket: UdpSocket,
    mut rx: mpsc::Receiver<DataPacket>,
    target: Arc<RwLock<Option<SocketAddr>>>,
    metrics: SharedMetrics,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let current = *target.read();
        let Some(addr) = current else {
            trace!("No data target, discarding {} packet", packet.kind);
            continue;
        };

        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {} packet: {}", packet.kind, e);
                continue;
            }
        };

        match socket.send_to(&bytes, addr).await {
            Ok(_) => metrics.update(|m| m.data_packets_sent += 1),
            Err(e) => debug!("Data send to {} failed: {}", addr, e),
        }
    }

    debug!("Data streamer stopped");
}
