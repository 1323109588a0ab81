//! Capture Controller
//!
//! PC side of a capture session: finds a device, answers its clock sync
//! pings and drives recording from a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard            # Plain logging, commands on stdin
//!   cargo run --release -- --connect 10.0.0.5:8888   # Skip discovery

mod dashboard;
mod metrics;
mod network;

use std::net::SocketAddr;
use std::sync::Arc;
use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    let connect = match args.iter().position(|a| a == "--connect") {
        Some(i) => {
            let addr = args.get(i + 1).ok_or("--connect needs host:port")?;
            Some(addr.parse::<SocketAddr>()?)
        }
        None => None,
    };

    let config = network::ControllerConfig::from_env(connect);

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new(config.controller_id.clone())));

    if use_dashboard {
        dashboard::run(config, metrics).await
    } else {
        network::run_with_logging(config, metrics).await
    }
}
