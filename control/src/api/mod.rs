pub mod nodes;
pub mod ws;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, services::ServeDir, trace::TraceLayer,
};

use crate::types::HealthResponse;
use nodes::AppState;

pub fn create_router(state: Arc<AppState>, webroot: &Path) -> Router {
    let static_files = ServeDir::new(webroot).append_index_html_on_directories(true);

    Router::new()
        // Health check
        .route("/health", get(health))
        // Read-only fleet view
        .route("/nodes", get(nodes::list_nodes))
        .route("/stats", get(nodes::get_stats))
        // Real-time channel
        .route("/ws", get(ws::upgrade))
        // Telemetry ingestion
        .route("/api/telemetry/nodes", post(nodes::ingest_sighting))
        .route("/api/telemetry/globals", post(nodes::ingest_global_stats))
        .fallback_service(static_files)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// GET /health - Health check endpoint
async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}
