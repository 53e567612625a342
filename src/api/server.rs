//! Monitoring API Server
//!
//! Serves the REST router with graceful shutdown.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::cache::CacheStoreRef;
use crate::monitoring::CacheMonitor;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Allow cross-origin requests (dashboards served elsewhere)
    pub cors_permissive: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            cors_permissive: true,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Monitoring API server
pub struct ApiServer {
    config: ApiServerConfig,
    cache: CacheStoreRef,
    monitor: Arc<CacheMonitor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, cache: CacheStoreRef, monitor: Arc<CacheMonitor>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            cache,
            monitor,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.config.rest_addr, "Starting monitoring API server");

        let rest_handle = self.spawn_rest_server();
        match rest_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "REST server task failed");
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let config = self.config.clone();
        let router = RestRouter::new(self.cache.clone(), self.monitor.clone());
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move { run_rest_server(config, router, shutdown_rx).await })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn run_rest_server(
    config: ApiServerConfig,
    router: RestRouter,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let cors = if config.cors_permissive {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };
    let app = router.build().layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let listener = tokio::net::TcpListener::bind(config.rest_addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
    info!(addr = %config.rest_addr, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
