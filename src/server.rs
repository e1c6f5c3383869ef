//! Process wiring: storage, fleet and the HTTP listener

use crate::api::{self, AppState};
use crate::config::Config;
use crate::database::Database;
use crate::fleet::Fleet;
use crate::recorder::ProcessLauncher;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let db = Arc::new(Database::open(&config.database_path)?);
    let launcher = Arc::new(ProcessLauncher::new(config.recorder_bin.clone()));
    let fleet = Fleet::new(&config, db, launcher);

    let restored = fleet.restore()?;
    if restored > 0 {
        info!("Restoring {} studio bindings", restored);
    }

    let app = api::router(AppState {
        fleet: fleet.clone(),
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    fleet.shutdown().await;
    served?;
    info!("Fleet coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = term.recv() => info!("Received SIGTERM"),
    }
}
