use crate::{
    config::ServerConfig,
    error::{CamlinkError, Result},
    hub::CameraHub,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{
    capture_handler, capture_result_handler, health_handler, read_slot_handler, status_handler,
    write_slot_handler,
};
use super::ws::websocket_handler;

/// Shared state for the Axum server
#[derive(Clone)]
pub struct ServerState {
    pub(crate) hub: Arc<CameraHub>,
}

/// Every endpoint of the hub: the event channel and the polling API
pub fn router(hub: Arc<CameraHub>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route(
            "/api/slots/:slot",
            get(read_slot_handler).put(write_slot_handler),
        )
        .route("/api/capture", post(capture_handler))
        .route("/api/capture/result", get(capture_result_handler))
        .route("/api/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(ServerState { hub })
}

/// HTTP front of a camera hub
pub struct HubServer {
    pub(crate) config: ServerConfig,
    pub(crate) hub: Arc<CameraHub>,
    cancellation_token: CancellationToken,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: Arc<CameraHub>) -> Self {
        Self {
            config,
            hub,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let addr = self.config.bind_address();
        info!("Starting hub server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| CamlinkError::Bind {
                address: addr.clone(),
                source: e,
            })?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Hub server listening on {}", addr);
        }

        axum::serve(listener, router(Arc::clone(&self.hub)))
            .with_graceful_shutdown(self.cancellation_token.clone().cancelled_owned())
            .await
            .map_err(|e| CamlinkError::component("server".to_string(), format!("Server error: {}", e)))?;

        info!("Hub server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }
}

/// Hub server builder for configuration
pub struct HubServerBuilder {
    config: Option<ServerConfig>,
    hub: Option<Arc<CameraHub>>,
}

impl HubServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            hub: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn hub(mut self, hub: Arc<CameraHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> Result<HubServer> {
        let config = self
            .config
            .ok_or_else(|| CamlinkError::component("server", "Server configuration is required"))?;

        let hub = self
            .hub
            .ok_or_else(|| CamlinkError::component("server", "Camera hub is required"))?;

        Ok(HubServer::new(config, hub))
    }
}

impl Default for HubServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
