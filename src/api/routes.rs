use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::ErrorResponse;
use crate::engine::Engine;
use crate::providers::directory::RouteDirectory;

#[derive(Clone)]
pub struct RoutesState {
    pub engine: Arc<Engine>,
    pub routes_file: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReloadResponse {
    pub routes: usize,
    pub schedules: usize,
    pub assignments: usize,
}

/// Reload the route directory and rebuild geometry and schedules
///
/// Called by the administrative side after a route's stop sequence was
/// edited. The swap is atomic per route; connected clients keep their
/// subscriptions.
#[utoipa::path(
    post,
    path = "/api/routes/reload",
    responses(
        (status = 200, description = "Directory reloaded", body = ReloadResponse),
        (status = 500, description = "Directory file unreadable or invalid", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn reload_routes(
    State(state): State<RoutesState>,
) -> Result<Json<ReloadResponse>, (StatusCode, Json<ErrorResponse>)> {
    let directory = RouteDirectory::load(&state.routes_file).map_err(|e| {
        tracing::error!(file = %state.routes_file, error = %e, "Failed to load route directory");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    let summary = state.engine.install_directory(&directory).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to install route directory");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    Ok(Json(ReloadResponse {
        routes: summary.routes,
        schedules: summary.schedules,
        assignments: summary.assignments,
    }))
}

pub fn router(engine: Arc<Engine>, routes_file: String) -> Router {
    let state = RoutesState {
        engine,
        routes_file,
    };
    Router::new()
        .route("/reload", post(reload_routes))
        .with_state(state)
}
