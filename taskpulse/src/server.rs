//! Server lifecycle
//!
//! Runs the HTTP/WebSocket listener and tears things down in order on
//! SIGTERM or Ctrl+C: stop accepting, close sockets, let in-flight requests
//! finish, flush pending writes, then close the database pool.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use taskpulse_api::{create_router, AppState};
use taskpulse_cluster::RealtimeHub;
use taskpulse_core::{Config, IdentityVerifier};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound on waiting for in-flight HTTP requests after shutdown starts
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TaskPulseServer {
    config: Config,
    pool: PgPool,
    hub: Arc<RealtimeHub>,
    verifier: Arc<dyn IdentityVerifier>,
}

impl TaskPulseServer {
    pub fn new(
        config: Config,
        pool: PgPool,
        hub: Arc<RealtimeHub>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            config,
            pool,
            hub,
            verifier,
        }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut http_handle = self.start_http_server(shutdown_rx).await?;
        info!("All servers started successfully");

        let http_exited = tokio::select! {
            result = &mut http_handle => {
                if let Err(e) = result {
                    error!("HTTP server task failed: {}", e);
                }
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Stop accepting new requests; open sockets would hold the drain open
        let _ = shutdown_tx.send(true);
        self.hub.close_connections();

        if !http_exited {
            match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, http_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTP server task failed: {}", e),
                Err(_) => warn!(
                    "HTTP server did not drain within {}s",
                    HTTP_DRAIN_TIMEOUT.as_secs()
                ),
            }
        }

        // Edits accepted during the drain are already buffered
        self.hub.shutdown().await;

        info!("Closing database connection pool...");
        self.pool.close().await;
        info!("TaskPulse server shut down complete");

        Ok(())
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let router = create_router(AppState::new(self.hub.clone(), self.verifier.clone()));

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
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
