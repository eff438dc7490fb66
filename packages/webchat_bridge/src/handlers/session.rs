use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::ApiError;
use crate::AppState;
use crate::models::non_empty;
use crate::relay::{SessionKind, SessionTicket, StartSessionRequest, VisitorContext};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    ok: bool,
    #[serde(flatten)]
    ticket: SessionTicket,
    public_base_url: String,
}

impl SessionResponse {
    fn new(state: &AppState, ticket: SessionTicket) -> Self {
        Self {
            ok: true,
            ticket,
            public_base_url: state.server_config.public_base_url.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct StartClientRequest {
    #[serde(default)]
    token: String,
    #[serde(flatten)]
    context: VisitorContext,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    #[serde(default)]
    session_uuid: Option<String>,
    #[serde(flatten)]
    context: VisitorContext,
}

impl SessionRef {
    fn session_id(&self) -> Result<String, ApiError> {
        non_empty(self.session_uuid.clone()).ok_or(ApiError::bad_request("missing_session"))
    }
}

pub async fn start_guest_session(
    State(state): State<AppState>,
    Json(context): Json<VisitorContext>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .relay
        .start_session(StartSessionRequest {
            kind: SessionKind::Guest,
            context,
        })
        .await?;
    Ok(Json(SessionResponse::new(&state, ticket)))
}

/// Start a session vouched for by the embedding site's signed token.
pub async fn start_client_session(
    State(state): State<AppState>,
    Json(request): Json<StartClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = state.verifier.verify(&request.token).map_err(|e| {
        info!(reason = e.code(), "Rejected widget token");
        ApiError::new(StatusCode::UNAUTHORIZED, "invalid_token")
    })?;

    let ticket = state
        .relay
        .start_session(StartSessionRequest {
            kind: SessionKind::Authenticated(identity),
            context: request.context,
        })
        .await?;
    Ok(Json(SessionResponse::new(&state, ticket)))
}

pub async fn resume_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRef>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = request.session_id()?;
    let ticket = state
        .relay
        .resume_session(&session_id, request.context)
        .await?;
    Ok(Json(SessionResponse::new(&state, ticket)))
}

pub async fn close_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRef>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = request.session_id()?;
    debug!(session_id = %session_id, "Close requested");
    state.relay.close_session(&session_id).await?;
    Ok(Json(json!({ "ok": true })))
}
