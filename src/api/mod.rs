//! HTTP API server for the plugin host
//!
//! Core routes (plugin admin, actions, live-event injection, realtime
//! websocket, health) are registered first; the shared plugin router is then
//! mounted once as the fallback, so every plugin route answers after the core
//! routes and ahead of the JSON 404.

pub mod actions;
pub mod health;
pub mod live;
pub mod plugins;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::plugins::PluginManager;
use crate::services::HostServices;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<PluginManager>,
}

impl ApiState {
    /// Host services behind the manager
    #[must_use]
    pub fn services(&self) -> &Arc<HostServices> {
        self.manager.services()
    }
}

/// Body of every mutating admin endpoint
#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// HTTP status for a host error
#[must_use]
pub const fn status_for(error: &crate::Error) -> StatusCode {
    match error {
        crate::Error::NotFound(_) => StatusCode::NOT_FOUND,
        crate::Error::PluginLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    manager: Arc<PluginManager>,
    port: u16,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(manager: Arc<PluginManager>, port: u16) -> Self {
        Self { manager, port }
    }

    /// Build the router and mount the shared plugin router on it
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RouterAlreadyMounted`] if the plugin router
    /// of this manager's host was already mounted
    pub fn build(self) -> Result<ApiServer> {
        let state = ApiState {
            manager: self.manager,
        };

        let router = Router::new()
            .nest("/api/plugins", plugins::router(state.clone()))
            .nest("/api/actions", actions::router(state.clone()))
            .nest("/api/live", live::router(state.clone()))
            .merge(websocket::router(state.clone()))
            .merge(health::router());

        let router = state.services().router.mount(router)?;

        // CORS layer for cross-origin requests from overlays and dashboards
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Ok(ApiServer {
            router: router.layer(cors).layer(TraceLayer::new_for_http()),
            state,
            port: self.port,
        })
    }
}

/// API server
pub struct ApiServer {
    router: Router,
    state: ApiState,
    port: u16,
}

impl ApiServer {
    /// The fully assembled router
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        let bridge = websocket::forward_lifecycle_events(&self.state.manager);

        tracing::info!(port = self.port, "API server listening");

        let served = axum::serve(listener, self.router)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")));

        bridge.abort();
        served
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
