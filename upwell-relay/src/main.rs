//! Upwell relay: forwards sync frames between peers editing the same document.
//!
//! Configured from the environment:
//! - `UPWELL_RELAY_ADDR`: bind address (default `127.0.0.1:9090`)
//! - `UPWELL_MAX_PEERS`: peers allowed per room (default 100)
//! - `RUST_LOG`: log filter (default `info`)

use log::{info, warn};
use upwell_collab::{RelayServer, ServerConfig};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("UPWELL_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(max) = std::env::var("UPWELL_MAX_PEERS") {
        match max.parse() {
            Ok(max) => config.max_peers_per_room = max,
            Err(e) => warn!("ignoring UPWELL_MAX_PEERS={max}: {e}"),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    info!(
        "Starting Upwell relay on {} ({} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} frames relayed",
                stats.total_connections, stats.total_frames
            );
            Ok(())
        }
    }
}
