use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::{Engine, GpsFix};

#[derive(Clone)]
pub struct FixesState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitFixRequest {
    /// Bus identity, already validated by the session layer
    pub bus_id: i64,
    pub lat: f64,
    pub lon: f64,
    /// Speed over ground in km/h
    pub speed_kmh: f64,
    /// Heading in degrees, 0 = north
    #[serde(default)]
    pub heading_deg: f64,
    /// Reported GPS accuracy radius in meters
    #[serde(default)]
    pub accuracy_m: f64,
    /// Device capture time (RFC 3339)
    #[schema(value_type = String)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitFixResponse {
    /// "accepted" or "rejected"
    pub status: &'static str,
    /// Rejection reason when status is "rejected"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Submit one GPS fix from a driver device
#[utoipa::path(
    post,
    path = "/api/fixes",
    request_body = SubmitFixRequest,
    responses(
        (status = 200, description = "Fix processed; rejected fixes carry a reason and are not fatal to the driver client", body = SubmitFixResponse)
    ),
    tag = "fixes"
)]
pub async fn submit_fix(
    State(state): State<FixesState>,
    Json(request): Json<SubmitFixRequest>,
) -> Json<SubmitFixResponse> {
    let fix = GpsFix {
        bus_id: request.bus_id,
        lat: request.lat,
        lon: request.lon,
        speed_kmh: request.speed_kmh,
        heading_deg: request.heading_deg,
        accuracy_m: request.accuracy_m,
        client_timestamp: request.timestamp,
        received_at: Utc::now(),
    };

    match state.engine.ingest(fix).await {
        Ok(()) => Json(SubmitFixResponse {
            status: "accepted",
            reason: None,
        }),
        Err(reason) => {
            tracing::debug!(
                bus_id = request.bus_id,
                reason = reason.as_str(),
                "Rejected fix"
            );
            Json(SubmitFixResponse {
                status: "rejected",
                reason: Some(reason.as_str()),
            })
        }
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = FixesState { engine };
    Router::new()
        .route("/", post(submit_fix))
        .with_state(state)
}
