//! Local control endpoint
//!
//! A small HTTP/JSON API for operators: liveness, counters, the active route
//! table and a reload trigger. Meant to bind on loopback only.

pub mod handlers;
pub mod models;

use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use snimux_router::SniRouter;
use snimux_server::ServerStats;

pub use models::ReloadResponse;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("No config file to reload from")]
    NotConfigured,

    #[error("{0}")]
    Rejected(String),
}

/// Re-reads configuration and applies it to the running server
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    async fn reload(&self) -> Result<ReloadResponse, ReloadError>;
}

/// Application state shared across handlers
pub struct ApiState {
    pub router: Arc<SniRouter>,
    pub stats: Arc<ServerStats>,
    pub reloader: Option<Arc<dyn ConfigReloader>>,
}

/// API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, state: ApiState) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/stats", get(handlers::get_stats))
            .route("/api/routes", get(handlers::list_routes))
            .route("/api/reload", post(handlers::reload))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!("Control endpoint listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
