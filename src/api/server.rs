//! API server.
//!
//! Axum server setup with the shared middleware stack and graceful shutdown.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, identity_middleware, request_id_middleware},
    routes::create_router,
};
use crate::config::ApiConfig;
use crate::errors::{CasinoError, CasinoResult};
use crate::services::ServiceContainer;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub struct ApiServer {
    config: ApiConfig,
    container: Arc<ServiceContainer>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, container: Arc<ServiceContainer>) -> Self {
        Self { config, container }
    }

    /// Run the HTTP server until a shutdown signal arrives.
    pub async fn run(self) -> CasinoResult<()> {
        let addr = self.socket_addr()?;
        let app = self.create_app();

        info!("Starting tresdice API server");
        info!("   Listen: http://{}", addr);
        self.log_server_info();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CasinoError::Configuration(format!("bind {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| CasinoError::Configuration(format!("server error: {}", e)))?;

        info!("API server stopped gracefully");
        Ok(())
    }

    /// Create the application with the shared middleware stack.
    pub fn create_app(&self) -> axum::Router {
        let state = Arc::new(AppState {
            container: self.container.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        create_router(state)
            // Request ID middleware (first for tracing)
            .layer(axum::middleware::from_fn(request_id_middleware))
            // Trusted identity header
            .layer(axum::middleware::from_fn(identity_middleware))
            // CORS layer (before timeout to handle preflight)
            .layer(create_cors_layer(self.config.allowed_origins.clone()))
            // Timeout layer
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            // Tracing layer (last for complete request tracing)
            .layer(TraceLayer::new_for_http())
    }

    fn socket_addr(&self) -> CasinoResult<SocketAddr> {
        let ip = self
            .config
            .listen_address
            .parse::<std::net::IpAddr>()
            .map_err(|e| {
                CasinoError::Configuration(format!(
                    "invalid listen address {}: {}",
                    self.config.listen_address, e
                ))
            })?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }

    fn log_server_info(&self) {
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!("Available endpoints:");
        info!("   GET  /health");
        info!("   POST /api/account/register");
        info!("   GET  /api/account/balance");
        info!("   GET  /api/account/transactions");
        info!("   POST /api/game/start");
        info!("   POST /api/game/:id/roll");
        info!("   POST /api/game/:id/cashout");
        info!("   GET  /api/game/:id");
        info!("   GET  /api/game/:id/verify");
        info!("   POST /api/deposit/webhook");
        info!("   POST /api/withdraw");
        info!("   GET  /api/affiliate/:id/stats");
        info!("   POST /api/affiliate/:id/periods/:period_id/finish");
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
