//! Discord implementation of [`SupportPlatform`].
//!
//! Calls go over the REST API; inbound agent replies arrive through the
//! gateway websocket ([`DiscordGateway`]) and are forwarded as
//! [`InboundPlatformMessage`]s.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::PlatformError;
use crate::platform::{ChannelInfo, ChannelKind, HandleKind, InboundPlatformMessage, SupportPlatform};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord rejects message bodies above this many characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Minutes of inactivity before Discord auto-archives a thread.
const AUTO_ARCHIVE_MINUTES: u32 = 1440;

// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 1 | (1 << 9) | (1 << 15);

const CHANNEL_GUILD_TEXT: u8 = 0;
const CHANNEL_ANNOUNCEMENT_THREAD: u8 = 10;
const CHANNEL_PUBLIC_THREAD: u8 = 11;
const CHANNEL_PRIVATE_THREAD: u8 = 12;

fn channel_kind(code: u8) -> ChannelKind {
    match code {
        CHANNEL_GUILD_TEXT => ChannelKind::Text,
        CHANNEL_PUBLIC_THREAD | CHANNEL_ANNOUNCEMENT_THREAD => ChannelKind::PublicThread,
        CHANNEL_PRIVATE_THREAD => ChannelKind::PrivateThread,
        _ => ChannelKind::Other,
    }
}

fn thread_type(kind: HandleKind) -> u8 {
    match kind {
        HandleKind::Public => CHANNEL_PUBLIC_THREAD,
        HandleKind::Private => CHANNEL_PRIVATE_THREAD,
    }
}

fn truncate_content(content: &str) -> String {
    content.chars().take(MAX_MESSAGE_LEN).collect()
}

#[derive(Deserialize)]
struct ChannelPayload {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Deserialize)]
struct UserPayload {
    username: String,
}

#[derive(Deserialize)]
struct IdPayload {
    id: String,
}

pub struct DiscordPlatform {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl DiscordPlatform {
    pub fn new(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    async fn check(resp: Response) -> Result<Response, PlatformError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::UNAUTHORIZED => Err(PlatformError::Unauthorized),
            StatusCode::NOT_FOUND => Err(PlatformError::NotFound),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(PlatformError::Rejected {
                    status: status.as_u16(),
                    message: body.chars().take(200).collect(),
                })
            }
        }
    }
}

#[async_trait]
impl SupportPlatform for DiscordPlatform {
    async fn authenticate(&self) -> Result<String, PlatformError> {
        let resp = self.request(Method::GET, "/users/@me").send().await?;
        let user: UserPayload = Self::check(resp).await?.json().await?;
        Ok(user.username)
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, PlatformError> {
        let resp = self
            .request(Method::GET, &format!("/channels/{}", channel_id))
            .send()
            .await?;
        let resp = match Self::check(resp).await {
            Ok(resp) => resp,
            Err(PlatformError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let channel: ChannelPayload = resp.json().await?;
        Ok(Some(ChannelInfo {
            id: channel.id,
            kind: channel_kind(channel.kind),
            parent_id: channel.parent_id,
        }))
    }

    async fn create_thread(
        &self,
        parent_id: &str,
        name: &str,
        kind: HandleKind,
    ) -> Result<String, PlatformError> {
        let body = json!({
            "name": name,
            "auto_archive_duration": AUTO_ARCHIVE_MINUTES,
            "type": thread_type(kind),
        });
        let resp = self
            .request(Method::POST, &format!("/channels/{}/threads", parent_id))
            .json(&body)
            .send()
            .await?;
        let created: IdPayload = Self::check(resp).await?.json().await?;
        debug!(thread_id = %created.id, %kind, "Created thread");
        Ok(created.id)
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PlatformError> {
        let body = json!({ "content": truncate_content(content) });
        let resp = self
            .request(Method::POST, &format!("/channels/{}/messages", channel_id))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<(), PlatformError> {
        let resp = self
            .request(Method::PATCH, &format!("/channels/{}", thread_id))
            .header("X-Audit-Log-Reason", "Chat closed by visitor")
            .json(&json!({ "archived": true }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
}

enum SessionEnd {
    /// Discord asked us to reconnect
    Reconnect,
    /// Nobody is listening anymore
    SinkClosed,
}

fn parse_message_create(d: &Value) -> Option<InboundPlatformMessage> {
    let author = d.get("author")?;
    Some(InboundPlatformMessage {
        channel_id: d.get("channel_id")?.as_str()?.to_string(),
        author: author
            .get("global_name")
            .and_then(Value::as_str)
            .or_else(|| author.get("username").and_then(Value::as_str))
            .unwrap_or("agent")
            .to_string(),
        author_is_bot: author.get("bot").and_then(Value::as_bool).unwrap_or(false),
        in_guild: d.get("guild_id").is_some_and(|g| !g.is_null()),
        content: d
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Gateway websocket client feeding `MESSAGE_CREATE` events into a channel.
///
/// Reconnects with capped exponential backoff. Only the event stream is
/// retried; REST calls made through [`DiscordPlatform`] never are.
pub struct DiscordGateway {
    token: String,
    url: String,
    max_backoff: Duration,
}

impl DiscordGateway {
    pub fn new(token: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            url: url.into(),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn spawn(self, events: mpsc::Sender<InboundPlatformMessage>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    pub async fn run(self, events: mpsc::Sender<InboundPlatformMessage>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.run_session(&events).await {
                Ok(SessionEnd::SinkClosed) => break,
                Ok(SessionEnd::Reconnect) => {
                    info!("Gateway requested reconnect");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => warn!(error = %e, backoff_secs = backoff.as_secs(), "Gateway session ended"),
            }
            if events.is_closed() {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
        info!("Gateway stopped");
    }

    async fn run_session(
        &self,
        events: &mpsc::Sender<InboundPlatformMessage>,
    ) -> Result<SessionEnd, PlatformError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| PlatformError::Gateway(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let heartbeat_ms = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload: GatewayPayload = serde_json::from_str(&text)?;
                    if payload.op == op::HELLO {
                        break payload.d["heartbeat_interval"].as_u64().unwrap_or(41_250);
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PlatformError::Gateway(e.to_string())),
                None => return Err(PlatformError::Gateway("closed before hello".into())),
            }
        };

        let identify = json!({
            "op": op::IDENTIFY,
            "d": {
                "token": self.token,
                "intents": GATEWAY_INTENTS,
                "properties": { "os": std::env::consts::OS, "browser": "webchat-bridge", "device": "webchat-bridge" },
            },
        });
        write
            .send(Message::Text(identify.to_string().into()))
            .await
            .map_err(|e| PlatformError::Gateway(e.to_string()))?;
        debug!(heartbeat_ms, "Gateway identified");

        let period = Duration::from_millis(heartbeat_ms);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut seq: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = json!({ "op": op::HEARTBEAT, "d": seq });
                    write
                        .send(Message::Text(beat.to_string().into()))
                        .await
                        .map_err(|e| PlatformError::Gateway(e.to_string()))?;
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return Err(PlatformError::Gateway(format!("closed by server: {:?}", frame)));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(PlatformError::Gateway(e.to_string())),
                        None => return Err(PlatformError::Gateway("stream ended".into())),
                    };
                    let payload: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "Skipping undecodable gateway frame");
                            continue;
                        }
                    };
                    if payload.s.is_some() {
                        seq = payload.s;
                    }
                    match payload.op {
                        op::DISPATCH if payload.t.as_deref() == Some("MESSAGE_CREATE") => {
                            if let Some(msg) = parse_message_create(&payload.d) {
                                if events.send(msg).await.is_err() {
                                    return Ok(SessionEnd::SinkClosed);
                                }
                            }
                        }
                        op::HEARTBEAT => heartbeat.reset_immediately(),
                        op::RECONNECT | op::INVALID_SESSION => return Ok(SessionEnd::Reconnect),
                        _ => {}
                    }
                }
                _ = events.closed() => return Ok(SessionEnd::SinkClosed),
            }
        }
    }
}
