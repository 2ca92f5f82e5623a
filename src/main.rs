pub mod api;
mod config;
mod engine;
mod providers;

use std::sync::Arc;

use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use engine::Engine;
use providers::directory::RouteDirectory;

#[derive(OpenApi)]
#[openapi(
    info(title = "Live Bus Tracking API", version = "0.1.0"),
    paths(
        api::fixes::submit_fix,
        api::etas::get_stop_etas,
        api::buses::get_buses_by_route,
        api::routes::reload_routes,
        api::health::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::fixes::SubmitFixRequest,
        api::fixes::SubmitFixResponse,
        api::etas::StopEtasResponse,
        api::buses::BusSnapshot,
        api::buses::BusesByRouteResponse,
        api::routes::ReloadResponse,
        api::health::HealthResponse,
        engine::Eta,
        engine::EtaMethod,
        engine::BusStatus,
    )),
    tags(
        (name = "fixes", description = "Driver GPS fix ingestion"),
        (name = "etas", description = "Arrival predictions per stop"),
        (name = "buses", description = "Live bus tracking"),
        (name = "routes", description = "Route directory management"),
        (name = "health", description = "Service health check")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    config.engine.validate();

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Build the engine and install the route directory
    let engine = Arc::new(Engine::new(config.engine.clone()));
    let directory =
        RouteDirectory::load(&config.routes_file).expect("Failed to load route directory");
    engine
        .install_directory(&directory)
        .await
        .expect("Failed to install route directory");

    // Start the staleness monitor in the background
    let sweep_engine = engine.clone();
    tokio::spawn(async move {
        sweep_engine.start().await;
    });

    // Build the app
    let app = axum::Router::new()
        .route("/", axum::routing::get(root))
        .nest("/api", api::router(engine, config.routes_file.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listen address");

    tracing::info!("Server running on http://{}", config.bind_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Live Bus Tracking API"
}
