use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::debug;

use crate::{
    hub::NotificationHub,
    services::NodeRegistry,
    types::{GlobalStats, GlobalStatsRequest, NodesResponse, SightingRequest},
};

pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub hub: Arc<NotificationHub>,
}

/// GET /nodes - Every known node plus the currently online ones
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<NodesResponse> {
    Json(state.registry.snapshot())
}

/// GET /stats - Latest global statistics
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GlobalStats>, (StatusCode, String)> {
    state
        .registry
        .statistics()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "No statistics received yet".to_string()))
}

/// POST /api/telemetry/nodes - One node sighting from the collector
///
/// The sighting is applied before the response, so sightings of one node
/// sent in sequence are applied in that order. Config pushes still run in
/// the background.
pub async fn ingest_sighting(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SightingRequest>,
) -> StatusCode {
    state
        .registry
        .insert_sighting(req.nodeinfo, req.statistics)
        .await;
    StatusCode::ACCEPTED
}

/// POST /api/telemetry/globals - Aggregate statistics for a site/domain
pub async fn ingest_global_stats(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GlobalStatsRequest>,
) -> StatusCode {
    debug!(site = %req.site, domain = %req.domain, "Received global statistics");
    state
        .registry
        .insert_global_stats(req.statistics, &req.site, &req.domain);
    StatusCode::ACCEPTED
}
