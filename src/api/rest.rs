// =============================================================================
// HTTP surface — Axum 0.7
// =============================================================================
//
// Operational endpoints beside the WebSocket upgrade:
//   GET /health        component status, always 200
//   GET /ready         200 only while every required adapter is ok
//   GET /metrics       Prometheus text exposition
//   GET /debug         full JSON dump of the state store
//   GET /api/v1/state  unfiltered snapshot frame (poll-friendly dashboards)
//   GET /api/v1/fills  bounded recent-fills ring, most recent first
//   GET /api/v1/history  bounded range query via the time-series facade
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::protocol::ServerMessage;
use crate::api::ws::ws_handler;
use crate::history::{validate_range, HistoryEntity};
use crate::hub::Hub;
use crate::projection::ViewFilter;
use crate::session::SessionInfo;
use crate::supervisor::AdapterStatus;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_path = hub.config.ws.path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_text))
        .route("/debug", get(debug_dump))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/fills", get(recent_fills))
        .route("/api/v1/history", get(history))
        .layer(cors)
        .with_state(hub)
}

// =============================================================================
// Health & readiness
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sequence: u64,
    uptime_secs: u64,
    clients: usize,
    sessions: Vec<SessionInfo>,
    adapters: std::collections::BTreeMap<String, AdapterStatus>,
}

async fn health(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        sequence: hub.store.sequence(),
        uptime_secs: hub.uptime_secs(),
        clients: hub.registry.count(),
        sessions: hub.registry.overview(),
        adapters: hub.supervisor.health(),
    })
}

async fn ready(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    if hub.supervisor.ready() {
        (StatusCode::OK, Json(serde_json::json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "ready": false,
                "adapters": hub.supervisor.health(),
            })),
        )
            .into_response()
    }
}

// =============================================================================
// Metrics & diagnostics
// =============================================================================

async fn metrics_text(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    hub.metrics.render()
}

async fn debug_dump(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(hub.store.debug_dump())
}

// =============================================================================
// State & fills
// =============================================================================

/// The same payload a WebSocket client receives as its first frame, for
/// consumers that prefer polling.
async fn full_state(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let projection = hub.store.snapshot(&ViewFilter::default());
    Json(ServerMessage::Snapshot {
        sequence: projection.sequence,
        data: projection,
    })
}

async fn recent_fills(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(hub.store.recent_fills(100))
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    entity: String,
    from: i64,
    to: i64,
    resolution: Option<String>,
}

async fn history(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let Some(entity) = HistoryEntity::parse(&query.entity) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown history entity {:?}", query.entity),
        );
    };

    if let Err(e) = validate_range(query.from, query.to, hub.config.history.max_range_s) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let resolution = query.resolution.as_deref().unwrap_or("1m");
    match hub
        .history
        .history(entity, query.from, query.to, resolution)
        .await
    {
        Ok(series) => Json(series).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
