//! Read-only admin views for the CMS plugin, guarded by `X-Admin-Key`.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::ApiError;
use crate::AppState;
use crate::models::now_millis;

const ADMIN_KEY_HEADER: &str = "x-admin-key";
const DEFAULT_SESSION_LIMIT: i64 = 100;
const DEFAULT_PAGE_VIEW_LIMIT: i64 = 200;
const MAX_RANGE_DAYS: u32 = 3650;
const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

const ADMIN_FAILED: ApiError = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "admin_failed");

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct AdminQuery {
    limit: Option<String>,
    range: Option<String>,
}

impl AdminQuery {
    fn limit(&self, default: i64) -> i64 {
        self.limit
            .as_deref()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(default)
    }

    fn range_label(&self) -> String {
        match self.range.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => "all".to_string(),
        }
    }

    /// Lower bound on `created_at`, `None` for the whole history.
    fn since(&self) -> Option<i64> {
        match parse_range_days(self.range.as_deref().unwrap_or_default()) {
            0 => None,
            days => Some(now_millis() - i64::from(days) * MILLIS_PER_DAY),
        }
    }
}

/// `day`/`week`/`month`/`year` or a day count. 0 means no bound.
pub fn parse_range_days(value: &str) -> u32 {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "all" => 0,
        "day" => 1,
        "week" => 7,
        "month" => 30,
        "year" => 365,
        other => other
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite() && *n >= 1.0)
            .map(|n| (n.floor() as u32).min(MAX_RANGE_DAYS))
            .unwrap_or(0),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_config.api_key.as_deref() else {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "admin_disabled"));
    };
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || provided != expected {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized"));
    }
    Ok(())
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let sessions = state
        .repository
        .list_sessions(query.since(), query.limit(DEFAULT_SESSION_LIMIT))
        .await
        .map_err(|e| {
            warn!("Admin session listing failed: {:#}", e);
            ADMIN_FAILED
        })?;

    Ok(Json(json!({
        "ok": true,
        "sessions": sessions,
        "range": query.range_label(),
    })))
}

/// One session with its transcript and page views.
pub async fn get_session_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let failed = |e: anyhow::Error| {
        warn!(session_id = %session_id, "Admin session lookup failed: {:#}", e);
        ADMIN_FAILED
    };

    let session = state
        .repository
        .get_session(&session_id)
        .await
        .map_err(failed)?
        .ok_or(ApiError::new(StatusCode::NOT_FOUND, "not_found"))?;
    let messages = state
        .repository
        .transcript(&session_id)
        .await
        .map_err(failed)?;
    let page_views = state
        .repository
        .page_views_for_session(
            &session_id,
            query.since(),
            query.limit(DEFAULT_PAGE_VIEW_LIMIT),
        )
        .await
        .map_err(failed)?;

    Ok(Json(json!({
        "ok": true,
        "session": session,
        "messages": messages,
        "pageViews": page_views,
        "range": query.range_label(),
    })))
}

pub async fn list_page_views(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let page_views = state
        .repository
        .recent_page_views(query.limit(DEFAULT_PAGE_VIEW_LIMIT))
        .await
        .map_err(|e| {
            warn!("Admin page view listing failed: {:#}", e);
            ADMIN_FAILED
        })?;

    Ok(Json(json!({ "ok": true, "pageViews": page_views })))
}

pub async fn get_database_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let stats = state.db.get_stats().await.map_err(|e| {
        warn!("Failed to get database stats: {:#}", e);
        ADMIN_FAILED
    })?;
    Ok(Json(json!({ "ok": true, "stats": stats })))
}
