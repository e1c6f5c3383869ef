//! audyn fleet coordinator
//!
//! Supervises a fleet of audyn AES67 recorder processes, binds studios to
//! sources and relays live level telemetry over WebSockets.

mod api;
mod assignment;
mod config;
mod database;
mod error;
mod events;
mod fleet;
mod recorder;
mod server;
mod session;
mod sources;
mod telemetry;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,audyn_fleet=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("audyn fleet coordinator starting...");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration loaded: {} recorder slots, archive under {}",
        config.supervisor.max_recorders,
        config.supervisor.archive.root.display()
    );

    if let Err(e) = std::fs::create_dir_all(&config.supervisor.archive.root) {
        error!("Failed to create archive root: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server::run(config).await {
        error!("Fleet coordinator error: {}", e);
        std::process::exit(1);
    }
}
