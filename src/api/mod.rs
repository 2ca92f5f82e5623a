pub mod buses;
pub mod etas;
pub mod fixes;
pub mod health;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::engine::Engine;

/// Standard error body returned by all endpoints
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(engine: Arc<Engine>, routes_file: String) -> Router {
    let ws_state = ws::WsState {
        engine: engine.clone(),
    };

    Router::new()
        .nest("/fixes", fixes::router(engine.clone()))
        .nest("/etas", etas::router(engine.clone()))
        .nest("/buses", buses::router(engine.clone()))
        .nest("/routes", routes::router(engine.clone(), routes_file))
        .nest("/health", health::router(engine))
        .route("/ws", get(ws::ws_events).with_state(ws_state))
}
