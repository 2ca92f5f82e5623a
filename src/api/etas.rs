use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::ErrorResponse;
use crate::engine::{Engine, Eta};

#[derive(Clone)]
pub struct EtasState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StopEtasResponse {
    pub stop_id: i64,
    /// Predicted arrivals of every tracked bus serving this stop, soonest
    /// first. Empty when no bus is currently estimable.
    pub etas: Vec<Eta>,
    pub computed_at: String,
}

/// Pull-based ETA snapshot for one stop
#[utoipa::path(
    get,
    path = "/api/etas/{stop_id}",
    params(
        ("stop_id" = i64, Path, description = "Stop to get arrival predictions for")
    ),
    responses(
        (status = 200, description = "Arrival predictions for the stop", body = StopEtasResponse),
        (status = 404, description = "No route serves this stop", body = ErrorResponse)
    ),
    tag = "etas"
)]
pub async fn get_stop_etas(
    State(state): State<EtasState>,
    Path(stop_id): Path<i64>,
) -> Result<Json<StopEtasResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.engine.etas_for_stop(stop_id).await {
        Some(etas) => Ok(Json(StopEtasResponse {
            stop_id,
            etas,
            computed_at: Utc::now().to_rfc3339(),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No route serves this stop".to_string(),
            }),
        )),
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = EtasState { engine };
    Router::new()
        .route("/{stop_id}", get(get_stop_etas))
        .with_state(state)
}
