//! WorkbenchServer
//!
//! REST API that Workbench keeps updated with the snapshot of each computer
//! it processes, phase by phase. Finished snapshots are linked to the
//! identifiers a user tags on the device and uploaded to DeviceHub. A small
//! dashboard API tags computers, edits Workbench's `config.ini` and lists
//! USBs and inventories.

mod config;
mod config_ini;
mod dashboard;
mod devicehub;
mod error;
mod extract;
mod handlers;
mod router;
mod settings;
mod snapshot;
mod state;
mod store;
mod uploader;
mod usb;

#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::router::create_router;
use crate::state::AppState;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workbench_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting WorkbenchServer...");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Configuration loaded: {:?}", config);

    let cancel = CancellationToken::new();

    // Open stores and start the uploader
    let app_state = match AppState::build(config.clone(), cancel.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, folder = ?config.folder, "Failed to initialize workbench folder");
            std::process::exit(1);
        }
    };
    info!(folder = ?config.folder, "Workbench folder ready");

    // Uploads resume once a DeviceHub connection arrives through /info
    let pending = app_state.store.list().await.len();
    info!(snapshots = pending, "Snapshot store opened");

    // Build router
    let app = create_router(app_state);

    // Bind and serve
    let port = config.server_port;
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Failed to bind to port");
            std::process::exit(1);
        }
    };

    info!(port = port, ip = %config.ip(), "Server listening");

    // Graceful shutdown handler
    let shutdown_cancel = cancel.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down...");
        shutdown_cancel.cancel();
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
