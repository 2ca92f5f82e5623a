use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::ErrorResponse;
use crate::engine::{BusProgress, BusStatus, Engine};

#[derive(Clone)]
pub struct BusesState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BusSnapshot {
    pub bus_id: i64,
    /// Last reported coordinate, kept even for offline buses
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Progress along the route in km from the first stop
    pub distance_along_km: f64,
    /// 0-based index of the stop the bus is heading toward
    pub next_stop_index: usize,
    pub smoothed_speed_kmh: f64,
    pub status: BusStatus,
    /// When the last fix was accepted (RFC 3339)
    pub last_updated_at: String,
}

impl BusSnapshot {
    fn from_progress(bus_id: i64, progress: &BusProgress) -> Self {
        let last_fix = progress.last_fix();
        Self {
            bus_id,
            lat: last_fix.map(|f| f.lat),
            lon: last_fix.map(|f| f.lon),
            distance_along_km: progress.projected_distance_km,
            next_stop_index: progress.projected_stop_index,
            smoothed_speed_kmh: progress.smoothed_speed_kmh,
            status: progress.status,
            last_updated_at: progress.last_updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BusesByRouteResponse {
    pub route_id: i64,
    pub buses: Vec<BusSnapshot>,
}

/// Live positions of all tracked buses on a route
#[utoipa::path(
    get,
    path = "/api/buses/by-route/{route_id}",
    params(
        ("route_id" = i64, Path, description = "Route to list tracked buses for")
    ),
    responses(
        (status = 200, description = "Tracked buses on the route", body = BusesByRouteResponse),
        (status = 404, description = "Route not found", body = ErrorResponse)
    ),
    tag = "buses"
)]
pub async fn get_buses_by_route(
    State(state): State<BusesState>,
    Path(route_id): Path<i64>,
) -> Result<Json<BusesByRouteResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.engine.buses_on_route(route_id).await {
        Some(buses) => Ok(Json(BusesByRouteResponse {
            route_id,
            buses: buses
                .iter()
                .map(|(bus_id, progress)| BusSnapshot::from_progress(*bus_id, progress))
                .collect(),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Route not found".to_string(),
            }),
        )),
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = BusesState { engine };
    Router::new()
        .route("/by-route/{route_id}", get(get_buses_by_route))
        .with_state(state)
}
