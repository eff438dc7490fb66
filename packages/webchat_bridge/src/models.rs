use chrono::Utc;
use serde::{Deserialize, Serialize};
use support_backend::HandleKind;

/// Milliseconds since the epoch; every timestamp column uses this unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Guest,
    Authenticated,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Guest => "guest",
            SessionMode::Authenticated => "authenticated",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "authenticated" {
            SessionMode::Authenticated
        } else {
            SessionMode::Guest
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Visitor,
    Agent,
    System,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Visitor => "visitor",
            Direction::Agent => "agent",
            Direction::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visitor" => Some(Direction::Visitor),
            "agent" => Some(Direction::Agent),
            "system" => Some(Direction::System),
            _ => None,
        }
    }
}

/// Where a session stands with respect to backend routing.
/// Derived from stored fields, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingState {
    New,
    ChannelBound,
    HandleBound,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionUuid")]
    pub session_id: String,
    pub mode: SessionMode,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub client_id: Option<String>,
    pub visitor_id: Option<String>,
    pub entry_url: Option<String>,
    pub referrer: Option<String>,
    pub backend_channel_id: Option<String>,
    pub backend_handle_id: Option<String>,
    pub handle_kind: Option<HandleKind>,
    pub last_page_url: Option<String>,
    pub last_seen_at: Option<i64>,
    pub geo_country: Option<String>,
    pub geo_region: Option<String>,
    pub geo_city: Option<String>,
    pub closed: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(session_id: String, mode: SessionMode) -> Self {
        let now = now_millis();
        Self {
            session_id,
            mode,
            visitor_name: None,
            visitor_email: None,
            client_id: None,
            visitor_id: None,
            entry_url: None,
            referrer: None,
            backend_channel_id: None,
            backend_handle_id: None,
            handle_kind: None,
            last_page_url: None,
            last_seen_at: None,
            geo_country: None,
            geo_region: None,
            geo_city: None,
            closed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn routing_state(&self) -> RoutingState {
        if self.closed {
            RoutingState::Closed
        } else if self.backend_handle_id.is_some() {
            RoutingState::HandleBound
        } else if self.backend_channel_id.is_some() {
            RoutingState::ChannelBound
        } else {
            RoutingState::New
        }
    }

    pub fn display_name(&self) -> &str {
        self.visitor_name.as_deref().unwrap_or("Guest")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// `None` until persisted; doubles as the insertion sequence
    pub id: Option<i64>,
    pub session_id: String,
    pub direction: Direction,
    pub author: Option<String>,
    pub body: String,
    pub created_at: i64,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        direction: Direction,
        author: Option<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            direction,
            author,
            body: body.into(),
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub id: Option<i64>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub url: String,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: i64,
}

/// Fields a hello may contribute. Merged with fill-empty-only semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityPatch {
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub visitor_id: Option<String>,
    pub entry_url: Option<String>,
    pub referrer: Option<String>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.visitor_name.is_none()
            && self.visitor_email.is_none()
            && self.visitor_id.is_none()
            && self.entry_url.is_none()
            && self.referrer.is_none()
    }
}

/// Telemetry from a page-tracking event. `None` never clears a stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingUpdate {
    pub last_page_url: Option<String>,
    pub last_seen_at: i64,
    pub visitor_id: Option<String>,
    pub geo_country: Option<String>,
    pub geo_region: Option<String>,
    pub geo_city: Option<String>,
}

/// Admin listing row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub routing_state: RoutingState,
    pub message_count: i64,
    pub last_message_at: Option<i64>,
}

/// Blank and whitespace-only strings count as absent.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_state_follows_stored_fields() {
        let mut s = Session::new("s1".into(), SessionMode::Guest);
        assert_eq!(s.routing_state(), RoutingState::New);

        s.backend_channel_id = Some("c1".into());
        assert_eq!(s.routing_state(), RoutingState::ChannelBound);

        s.backend_handle_id = Some("t1".into());
        assert_eq!(s.routing_state(), RoutingState::HandleBound);

        s.closed = true;
        assert_eq!(s.routing_state(), RoutingState::Closed);
    }

    #[test]
    fn session_serializes_with_wire_names() {
        let s = Session::new("abc".into(), SessionMode::Authenticated);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["sessionUuid"], "abc");
        assert_eq!(json["mode"], "authenticated");
        assert!(json["backendHandleId"].is_null());
    }

    #[test]
    fn direction_round_trips_through_text() {
        for d in [Direction::Visitor, Direction::Agent, Direction::System] {
            assert_eq!(Direction::parse(d.as_str()), Some(d));
        }
        assert_eq!(Direction::parse("robot"), None);
    }

    #[test]
    fn non_empty_trims_and_drops_blanks() {
        assert_eq!(non_empty(Some("  Ann ".into())), Some("Ann".into()));
        assert_eq!(non_empty(Some("   ".into())), None);
        assert_eq!(non_empty(None), None);
    }
}
