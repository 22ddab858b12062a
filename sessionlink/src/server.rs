//! Server lifecycle.
//!
//! Wires the call store, connection hub and membership coordinator into the
//! HTTP router, runs the stale-socket sweeper, and drains on SIGINT/SIGTERM.

use sessionlink_api::{create_router, http::websocket::spawn_stale_sweeper, AppState, MethodRegistry};
use sessionlink_core::{repository::CallStore, Config};
use sessionlink_signaling::{CallMembershipCoordinator, ConnectionHub};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct SessionLinkServer {
    config: Config,
    store: Arc<dyn CallStore>,
}

impl SessionLinkServer {
    pub fn new(config: Config, store: Arc<dyn CallStore>) -> Self {
        Self { config, store }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let hub = ConnectionHub::new();
        let coordinator =
            CallMembershipCoordinator::new(self.store, hub.clone(), self.config.signaling.sync_throttle());
        let state = AppState::new(
            coordinator,
            MethodRegistry::with_video_call_methods(),
            self.config.signaling.clone(),
        );
        let router = create_router(state, &self.config.server);

        let shutdown = CancellationToken::new();
        let sweeper = spawn_stale_sweeper(
            hub.clone(),
            self.config.signaling.stale_sweep_interval(),
            shutdown.clone(),
        );

        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let graceful = {
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                info!("Shutdown signal received, starting graceful shutdown...");
                shutdown.cancel();
            }
        };

        let result = axum::serve(listener, router).with_graceful_shutdown(graceful).await;

        shutdown.cancel();
        if let Err(e) = sweeper.await {
            error!("Stale sweeper task failed: {}", e);
        }
        info!(
            open_connections = hub.connection_count(),
            "HTTP server shut down"
        );

        result.map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
