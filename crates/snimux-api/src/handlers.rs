use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use problem_details::ProblemDetails;
use std::sync::Arc;
use tracing::{info, warn};

use snimux_server::StatsSnapshot;

use crate::models::{HealthResponse, RouteInfo, RouteList};
use crate::{ApiState, ReloadError};

/// Convert reload errors to Problem Details responses
fn reload_error_to_problem(error: ReloadError) -> Response {
    let (status, title) = match &error {
        ReloadError::NotConfigured => (StatusCode::NOT_FOUND, "Reload Not Available"),
        ReloadError::Rejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, "Reload Rejected"),
    };

    let problem = ProblemDetails::new()
        .with_status(status)
        .with_title(title)
        .with_detail(error.to_string());

    (status, Json(problem)).into_response()
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: state.stats.active(),
    })
}

/// Connection counters
pub async fn get_stats(State(state): State<Arc<ApiState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Active route table with backend health
pub async fn list_routes(State(state): State<Arc<ApiState>>) -> Json<RouteList> {
    let table = state.router.table();
    let health = state.router.health();

    Json(RouteList {
        routes: table
            .routes()
            .map(|(pattern, backend)| RouteInfo::new(pattern, backend, health))
            .collect(),
        default_backend: table
            .default_backend()
            .map(|backend| RouteInfo::default_route(backend, health)),
    })
}

/// Re-read the config file and swap in the new route table
pub async fn reload(State(state): State<Arc<ApiState>>) -> Response {
    let Some(reloader) = state.reloader.as_ref() else {
        return reload_error_to_problem(ReloadError::NotConfigured);
    };

    match reloader.reload().await {
        Ok(summary) => {
            info!("Reload via control endpoint applied ({} routes)", summary.routes);
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(e) => {
            warn!("Reload via control endpoint failed: {}", e);
            reload_error_to_problem(e)
        }
    }
}
