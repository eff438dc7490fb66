pub mod admin;
pub mod health;
pub mod session;
pub mod tracking;
pub mod websocket;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::relay::RelayError;

// Re-export all handlers for easy route registration
pub use admin::{get_database_stats, get_session_detail, list_page_views, list_sessions};
pub use health::{health_handler, health_ready_handler, metrics_handler};
pub use session::{close_session, resume_session, start_client_session, start_guest_session};
pub use tracking::track_page;
pub use websocket::visitor_websocket_handler;

/// `{ok: false, error: code}` with a status. Every failing API call answers
/// with this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
}

impl ApiError {
    pub const fn new(status: StatusCode, code: &'static str) -> Self {
        Self { status, code }
    }

    pub const fn bad_request(code: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "ok": false, "error": self.code }))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let status = match &e {
            RelayError::UnknownSession => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Unavailable(inner) => {
                error!("Session store unavailable: {:#}", inner);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, e.code())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
