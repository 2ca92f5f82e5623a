use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::engine::Engine;

#[derive(Clone)]
pub struct HealthState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Number of routes with built geometry
    pub routes_loaded: usize,
    /// Number of routes with a loaded timetable
    pub schedules_loaded: usize,
    /// Number of buses with a live progress record
    pub tracked_buses: usize,
    /// Number of connected real-time clients
    pub connected_clients: usize,
    /// Number of active topic subscriptions across all clients
    pub subscriptions: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let hub = state.engine.hub();
    Json(HealthResponse {
        healthy: true,
        routes_loaded: state.engine.routes_loaded().await,
        schedules_loaded: state.engine.schedules_loaded().await,
        tracked_buses: state.engine.tracked_buses().await,
        connected_clients: hub.client_count().await,
        subscriptions: hub.subscription_count().await,
    })
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = HealthState { engine };
    Router::new()
        .route("/", get(health_check))
        .with_state(state)
}
