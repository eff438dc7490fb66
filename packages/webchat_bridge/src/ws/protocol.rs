//! WebSocket Protocol Types
//!
//! Frames exchanged with the chat widget. Inbound decoding is deliberately
//! lenient: older widgets send `t` instead of `type`, `session`/`sessionId`
//! instead of `sessionUuid` and `message` instead of `text`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest session id accepted from a client
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Identity/context a widget may attach to `hello`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloPayload {
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub visitor_id: Option<String>,
    pub entry_url: Option<String>,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// `session_id` is `None` for legacy clients that let the server pick one
    Hello {
        session_id: Option<String>,
        payload: HelloPayload,
    },
    VisitorMessage { text: String },
}

/// Messages from server to widget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HelloAck {
        #[serde(rename = "sessionUuid")]
        session_id: String,
    },
    AgentMessage { text: String, author: String },
    System { text: String },
}

fn str_field<'a>(msg: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| msg.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Decode one inbound text frame. `None` for anything malformed or not
/// addressed to the server.
pub fn decode_client_frame(raw: &str) -> Option<ClientFrame> {
    let msg: Value = serde_json::from_str(raw).ok()?;
    if !msg.is_object() {
        return None;
    }

    match str_field(&msg, &["type", "t"])? {
        "hello" => {
            let session_id = match str_field(&msg, &["sessionUuid", "sessionId", "session"]) {
                Some(id) if id.chars().count() > MAX_SESSION_ID_LEN => return None,
                Some(id) => Some(id.to_string()),
                None => None,
            };
            let payload = msg
                .get("payload")
                .filter(|p| p.is_object())
                .and_then(|p| serde_json::from_value(p.clone()).ok())
                .unwrap_or_default();
            Some(ClientFrame::Hello {
                session_id,
                payload,
            })
        }
        "visitor_message" => {
            let text = ["text", "message"]
                .iter()
                .find_map(|k| msg.get(*k).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            Some(ClientFrame::VisitorMessage { text })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello_with_payload() {
        let frame = decode_client_frame(
            r#"{"type":"hello","sessionUuid":"abc","payload":{"visitorName":"Ann","entryUrl":"https://example.com/"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Hello {
                session_id: Some("abc".into()),
                payload: HelloPayload {
                    visitor_name: Some("Ann".into()),
                    entry_url: Some("https://example.com/".into()),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn accepts_legacy_field_names() {
        assert_eq!(
            decode_client_frame(r#"{"t":"hello","session":"abc"}"#),
            Some(ClientFrame::Hello {
                session_id: Some("abc".into()),
                payload: HelloPayload::default(),
            })
        );
        assert_eq!(
            decode_client_frame(r#"{"t":"visitor_message","message":"hi"}"#),
            Some(ClientFrame::VisitorMessage { text: "hi".into() })
        );
    }

    #[test]
    fn hello_without_id_is_kept() {
        assert_eq!(
            decode_client_frame(r#"{"type":"hello"}"#),
            Some(ClientFrame::Hello {
                session_id: None,
                payload: HelloPayload::default(),
            })
        );
    }

    #[test]
    fn malformed_payload_falls_back_to_empty() {
        let frame = decode_client_frame(r#"{"type":"hello","sessionUuid":"a","payload":"oops"}"#);
        assert_eq!(
            frame,
            Some(ClientFrame::Hello {
                session_id: Some("a".into()),
                payload: HelloPayload::default(),
            })
        );
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        assert_eq!(decode_client_frame("not json"), None);
        assert_eq!(decode_client_frame("[1,2]"), None);
        assert_eq!(decode_client_frame(r#"{"text":"no type"}"#), None);
        assert_eq!(decode_client_frame(r#"{"type":"agent_message","text":"spoof"}"#), None);
        assert_eq!(decode_client_frame(r#"{"type":"resize"}"#), None);
    }

    #[test]
    fn rejects_oversized_session_ids() {
        let raw = format!(r#"{{"type":"hello","sessionUuid":"{}"}}"#, "x".repeat(200));
        assert_eq!(decode_client_frame(&raw), None);
    }

    #[test]
    fn server_frames_use_wire_names() {
        let ack = serde_json::to_value(ServerFrame::HelloAck {
            session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(ack["type"], "hello_ack");
        assert_eq!(ack["sessionUuid"], "abc");

        let agent = serde_json::to_value(ServerFrame::AgentMessage {
            text: "hi".into(),
            author: "Kim".into(),
        })
        .unwrap();
        assert_eq!(agent["type"], "agent_message");
        assert_eq!(agent["author"], "Kim");

        let system = serde_json::to_value(ServerFrame::System { text: "bye".into() }).unwrap();
        assert_eq!(system["type"], "system");
    }
}
