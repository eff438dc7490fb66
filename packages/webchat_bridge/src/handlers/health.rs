use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::AppState;

/// Liveness probe - returns 200 while the process is up
pub async fn health_handler() -> &'static str {
    "ok"
}

/// Metrics endpoint - counters plus live hub gauges
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "relay": state.metrics.snapshot(),
        "hub": {
            "connections": state.hub.total_connections(),
            "sessions": state.hub.session_count(),
        },
    }))
}

/// Readiness probe - the database must answer. The support backend is
/// reported but never gates readiness since chats are still persisted
/// while it is down.
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.ping().await.is_ok();
    let backend = state.bridge.state().await;

    let body = json!({
        "status": if db_ok { "ready" } else { "not_ready" },
        "database": if db_ok { "connected" } else { "disconnected" },
        "backend": backend,
    });
    if db_ok {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
