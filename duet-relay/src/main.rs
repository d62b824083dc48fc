//! Duet relay — sequences document and shell updates for a room and fans
//! out notifications to its peers.
//!
//! Usage: `duet-relay [config.json]`. Without a config file the relay
//! listens on the default address.

use log::{error, info};

use duet_sync::relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => {
                info!("Loaded relay config from {path}");
                config
            }
            Err(e) => {
                error!("Failed to load {path}: {e}");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };

    let server = RelayServer::new(config);
    info!("Starting duet relay on {}", server.bind_addr());
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
