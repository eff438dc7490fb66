//! Page-view tracking from the widget's host page.

use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::{Extensions, HeaderMap, header::USER_AGENT},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};

use super::ApiError;
use crate::AppState;
use crate::models::{PageView, now_millis};

const MAX_URL_LEN: usize = 2048;
const MAX_ID_LEN: usize = 64;
const MAX_TITLE_LEN: usize = 512;
const MAX_USER_AGENT_LEN: usize = 512;

/// Proxy headers consulted for the visitor address, in priority order.
const CLIENT_IP_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackPageRequest {
    url: Option<String>,
    visitor_id: Option<String>,
    session_uuid: Option<String>,
    title: Option<String>,
    referrer: Option<String>,
}

/// First `max` characters, `None` when nothing is left after trimming.
fn clip(value: Option<String>, max: usize) -> Option<String> {
    let value = value?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.chars().take(max).collect())
}

fn strip_mapped(ip: &str) -> &str {
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}

fn is_private_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

/// Best guess at the visitor's public address. The first non-private
/// candidate from the proxy headers wins, then the first candidate of any
/// kind, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
    let mut candidates = Vec::new();
    for name in CLIENT_IP_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        candidates.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(strip_mapped),
        );
    }

    candidates
        .iter()
        .find(|ip| !is_private_ip(ip))
        .or(candidates.first())
        .map(|ip| ip.to_string())
        .or_else(|| peer.map(|ip| strip_mapped(&ip.to_string()).to_string()))
}

pub async fn track_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<TrackPageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = clip(request.url, MAX_URL_LEN).ok_or(ApiError::bad_request("missing_url"))?;
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let view = PageView {
        id: None,
        session_id: clip(request.session_uuid, MAX_ID_LEN),
        visitor_id: clip(request.visitor_id, MAX_ID_LEN),
        url,
        title: clip(request.title, MAX_TITLE_LEN),
        referrer: clip(request.referrer, MAX_URL_LEN),
        ip: client_ip(&headers, peer),
        user_agent: clip(user_agent, MAX_USER_AGENT_LEN),
        created_at: now_millis(),
    };

    state.relay.track_page(view).await?;
    Ok(Json(json!({ "ok": true })))
}
