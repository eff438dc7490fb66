//! Session Relay
//!
//! Owns the mapping between a visitor session, its live connections and its
//! backend conversation handle. Every lifecycle call (start, resume, close)
//! and every transport event flows through here.
//!
//! Handle creation is single-flight per session: a per-session async mutex
//! serializes attempts, the session row is re-read under that lock, and the
//! store binds the handle with a compare-and-set. Store and backend failures
//! are logged and counted, never propagated to the visitor.

mod channel;
mod heuristics;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use support_backend::{
    BackendBridge, EnsureHandleOutcome, EnsureHandleRequest, HandleKind, InboundAgentMessage,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::identity::VerifiedIdentity;
use crate::metrics::RelayMetrics;
use crate::models::{
    Direction, IdentityPatch, Message, PageView, Session, SessionMode, TrackingUpdate, non_empty,
};
use crate::store::SessionStore;
use crate::ws::{FrameHandler, HelloPayload, ServerFrame, TransportHub};

pub use channel::select_channel;
pub use heuristics::{IdentityHints, sniff_identity};

pub const CLOSED_BY_VISITOR: &str = "Chat closed by visitor.";
const SYSTEM_AUTHOR: &str = "System";
const SESSION_ID_BYTES: usize = 18;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unknown session")]
    UnknownSession,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The session store could not be read or written
    #[error("session store unavailable: {0}")]
    Unavailable(anyhow::Error),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::UnknownSession => "unknown_session",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Unavailable(_) => "store_unavailable",
        }
    }
}

/// Where sessions are routed on the backend.
#[derive(Clone, Debug, Default)]
pub struct RoutingConfig {
    /// Containers handles are created under; also the bridge allow-list
    pub containers: Vec<String>,
    pub handle_kind: HandleKind,
}

/// What the widget knows about the visitor when it asks for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitorContext {
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub visitor_id: Option<String>,
    pub entry_url: Option<String>,
    pub referrer: Option<String>,
}

impl VisitorContext {
    fn into_patch(self) -> IdentityPatch {
        IdentityPatch {
            visitor_name: non_empty(self.visitor_name),
            visitor_email: non_empty(self.visitor_email),
            visitor_id: non_empty(self.visitor_id),
            entry_url: non_empty(self.entry_url),
            referrer: non_empty(self.referrer),
        }
    }
}

impl From<HelloPayload> for VisitorContext {
    fn from(p: HelloPayload) -> Self {
        Self {
            visitor_name: p.visitor_name,
            visitor_email: p.visitor_email,
            visitor_id: p.visitor_id,
            entry_url: p.entry_url,
            referrer: p.referrer,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionKind {
    Guest,
    /// Identity already verified by the caller; trusted as-is
    Authenticated(VerifiedIdentity),
}

#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub kind: SessionKind,
    pub context: VisitorContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    #[serde(rename = "sessionUuid")]
    pub session_id: String,
    /// A backend handle is bound and messages will reach agents
    pub handle_ready: bool,
}

pub struct SessionRelay {
    store: Arc<dyn SessionStore>,
    bridge: Arc<BackendBridge>,
    hub: Arc<TransportHub>,
    routing: RoutingConfig,
    metrics: Arc<RelayMetrics>,
    handle_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Handles created on the backend whose bind failed to persist. Reused
    /// by the next event instead of creating another one.
    unbound_handles: DashMap<String, UnboundHandle>,
}

#[derive(Clone, Debug)]
struct UnboundHandle {
    handle_id: String,
    channel_id: String,
    kind: HandleKind,
    fell_back: bool,
}

/// 18 random bytes, base64url: 24 URL-safe characters.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn session_summary(session: &Session) -> String {
    let mut lines = vec![
        "**New Live Chat Session**".to_string(),
        format!("Session: `{}`", session.session_id),
    ];
    if session.mode == SessionMode::Authenticated {
        lines.push("Authenticated: **Yes**".to_string());
        if let Some(client_id) = &session.client_id {
            lines.push(format!("Client ID: #{}", client_id));
        }
    }
    let email = session
        .visitor_email
        .as_deref()
        .map(|e| format!(" <{}>", e))
        .unwrap_or_default();
    lines.push(format!("Visitor: **{}**{}", session.display_name(), email));
    lines.push(format!(
        "Entry: {}",
        session.entry_url.as_deref().unwrap_or("(unknown)")
    ));
    lines.join("\n")
}

impl SessionRelay {
    /// Build the relay and register it as the hub's frame handler before any
    /// connection is accepted.
    pub fn new(
        store: Arc<dyn SessionStore>,
        bridge: Arc<BackendBridge>,
        hub: Arc<TransportHub>,
        routing: RoutingConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        let relay = Arc::new(Self {
            store,
            bridge,
            hub: hub.clone(),
            routing,
            metrics,
            handle_locks: DashMap::new(),
            unbound_handles: DashMap::new(),
        });
        let handler = Arc::downgrade(&relay) as std::sync::Weak<dyn FrameHandler>;
        if !hub.set_handler(handler) {
            warn!("Transport hub already had a frame handler; keeping the first one");
        }
        relay
    }

    fn store_failure(&self, op: &'static str, session_id: &str, e: &anyhow::Error) {
        self.metrics.store_failure();
        error!(op, session_id, error = %e, "Session store failure");
    }

    /// Seed for container selection: authenticated client id, then visitor id,
    /// then the session id itself.
    fn pick_channel(&self, session: &Session) -> Option<String> {
        let seed = session
            .client_id
            .as_deref()
            .filter(|_| session.mode == SessionMode::Authenticated)
            .or(session.visitor_id.as_deref())
            .unwrap_or(&session.session_id);
        select_channel(&self.routing.containers, seed).map(str::to_string)
    }

    async fn load(&self, session_id: &str) -> Result<Session, RelayError> {
        match self.store.get(session_id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(RelayError::UnknownSession),
            Err(e) => {
                self.store_failure("get", session_id, &e);
                Err(RelayError::Unavailable(e))
            }
        }
    }

    // =========================================================================
    // Lifecycle calls
    // =========================================================================

    /// Create a session and try to bind its backend handle before returning,
    /// so the first visitor message never waits on handle creation. Succeeds
    /// even when the backend is down.
    pub async fn start_session(
        &self,
        req: StartSessionRequest,
    ) -> Result<SessionTicket, RelayError> {
        let session_id = new_session_id();
        let mut session = Session::new(session_id.clone(), SessionMode::Guest);
        let ctx = req.context.into_patch();

        session.visitor_name = ctx.visitor_name;
        session.visitor_email = ctx.visitor_email;
        if let SessionKind::Authenticated(identity) = &req.kind {
            if let Some(client_id) = identity.authenticated_client_id() {
                session.mode = SessionMode::Authenticated;
                session.client_id = Some(client_id.to_string());
            }
            // Signed identity beats whatever the widget typed
            session.visitor_name = identity.name.clone().or(session.visitor_name);
            session.visitor_email = identity.email.clone().or(session.visitor_email);
        }
        session.visitor_id = ctx.visitor_id;
        session.entry_url = ctx.entry_url;
        session.referrer = ctx.referrer;
        session.backend_channel_id = self.pick_channel(&session);

        if let Err(e) = self.store.upsert(&session).await {
            self.store_failure("upsert", &session_id, &e);
            return Err(RelayError::Unavailable(e));
        }
        self.metrics.session_started();
        info!(
            session_id = %session_id,
            mode = session.mode.as_str(),
            channel_id = session.backend_channel_id.as_deref().unwrap_or("-"),
            "Session started"
        );

        let handle = self.ensure_session_handle(&session_id).await;
        Ok(SessionTicket {
            session_id,
            handle_ready: handle.is_some(),
        })
    }

    /// Re-attach to an existing session, repairing its handle if the backend
    /// was down when it was created.
    pub async fn resume_session(
        &self,
        session_id: &str,
        context: VisitorContext,
    ) -> Result<SessionTicket, RelayError> {
        if session_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("missing session id".into()));
        }
        let session = self.load(session_id).await?;

        let patch = context.into_patch();
        if !patch.is_empty() {
            if let Err(e) = self.store.fill_identity(session_id, &patch).await {
                self.store_failure("fill_identity", session_id, &e);
            }
        }

        let handle_ready = match session.backend_handle_id {
            Some(_) => true,
            None if session.closed => false,
            None => self.ensure_session_handle(session_id).await.is_some(),
        };
        debug!(session_id, handle_ready, "Session resumed");

        Ok(SessionTicket {
            session_id: session.session_id,
            handle_ready,
        })
    }

    /// End the chat: mark closed, leave a system message, archive the handle.
    /// Closing an already-closed session is a no-op.
    pub async fn close_session(&self, session_id: &str) -> Result<(), RelayError> {
        if session_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("missing session id".into()));
        }
        let session = self.load(session_id).await?;
        if session.closed {
            debug!(session_id, "Session already closed");
            return Ok(());
        }

        // The transition winner does the side effects exactly once
        match self.store.mark_closed(session_id).await {
            Ok(true) => self.metrics.session_closed(),
            Ok(false) => return Ok(()),
            Err(e) => self.store_failure("mark_closed", session_id, &e),
        }

        let note = Message::new(
            session_id,
            Direction::System,
            Some(SYSTEM_AUTHOR.to_string()),
            CLOSED_BY_VISITOR,
        );
        if let Err(e) = self.store.append_message(&note).await {
            self.store_failure("append_message", session_id, &e);
        }

        let handle_id = session.backend_handle_id.clone().or_else(|| {
            self.unbound_handles
                .remove(session_id)
                .map(|(_, unbound)| unbound.handle_id)
        });
        if let Some(handle_id) = &handle_id {
            let outcome = self.bridge.archive_handle(handle_id).await;
            if let support_backend::CallOutcome::Failed { reason } = outcome {
                warn!(session_id, handle_id = %handle_id, reason = reason.code(), "Failed to archive handle");
            }
        }

        self.hub.broadcast_to_session(
            session_id,
            &ServerFrame::System {
                text: CLOSED_BY_VISITOR.to_string(),
            },
        );
        info!(session_id, "Session closed");
        Ok(())
    }

    /// Record a page view and merge its telemetry into the owning session.
    /// Geo fields are left to external enrichment; nothing here clears them.
    pub async fn track_page(&self, view: PageView) -> Result<(), RelayError> {
        if view.url.trim().is_empty() {
            return Err(RelayError::InvalidRequest("missing url".into()));
        }
        let owner = view.session_id.as_deref().unwrap_or("-");
        if let Err(e) = self.store.record_page_view(&view).await {
            self.store_failure("record_page_view", owner, &e);
            return Err(RelayError::Unavailable(e));
        }

        if let Some(session_id) = &view.session_id {
            let update = TrackingUpdate {
                last_page_url: Some(view.url.clone()),
                last_seen_at: view.created_at,
                visitor_id: view.visitor_id.clone(),
                ..Default::default()
            };
            if let Err(e) = self.store.update_tracking(session_id, &update).await {
                self.store_failure("update_tracking", session_id, &e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    /// Fill-empty merge of hello context. Unknown sessions are ignored (stale
    /// client state). Binds a container if none is set yet; never creates a handle.
    pub async fn handle_hello(&self, session_id: &str, payload: HelloPayload) {
        let session = match self.store.get(session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(session_id, "hello for unknown session");
                return;
            }
            Err(e) => {
                self.store_failure("get", session_id, &e);
                return;
            }
        };

        let patch = VisitorContext::from(payload).into_patch();
        if !patch.is_empty() {
            if let Err(e) = self.store.fill_identity(session_id, &patch).await {
                self.store_failure("fill_identity", session_id, &e);
            }
        }

        if session.backend_channel_id.is_none() && !session.closed {
            let mut seeded = session;
            seeded.visitor_id = seeded.visitor_id.or(patch.visitor_id);
            if let Some(channel_id) = self.pick_channel(&seeded) {
                if let Err(e) = self.store.bind_channel(session_id, &channel_id).await {
                    self.store_failure("bind_channel", session_id, &e);
                }
            }
        }
    }

    /// Persist a visitor message, then deliver it to the session's handle.
    /// The two side effects are independent and each attempted once.
    pub async fn handle_visitor_message(&self, session_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let hints = sniff_identity(text);
        if !hints.is_empty() {
            if let Err(e) = self
                .store
                .record_identity(session_id, hints.name.as_deref(), hints.email.as_deref())
                .await
            {
                self.store_failure("record_identity", session_id, &e);
            }
        }

        let message = Message::new(session_id, Direction::Visitor, None, text);
        match self.store.append_message(&message).await {
            Ok(_) => self.metrics.message_persisted(),
            Err(e) => self.store_failure("append_message", session_id, &e),
        }

        let Some(handle_id) = self.ensure_session_handle(session_id).await else {
            self.metrics.delivery(false);
            warn!(session_id, "No backend handle; visitor message kept locally only");
            return;
        };

        let outcome = self
            .bridge
            .post_message(&handle_id, &format!("**Visitor:** {}", text))
            .await;
        self.metrics.delivery(outcome.is_ok());
        if let support_backend::CallOutcome::Failed { reason } = outcome {
            warn!(session_id, handle_id = %handle_id, reason = reason.code(), "Visitor message not delivered");
        }
    }

    /// Persist an agent reply and fan it out to the visitor's live connections.
    pub async fn handle_inbound_backend_message(&self, msg: InboundAgentMessage) {
        let body = msg.body.trim();
        if body.is_empty() {
            return;
        }
        self.metrics.agent_message();

        let message = Message::new(
            &msg.session_id,
            Direction::Agent,
            Some(msg.author.clone()),
            body,
        );
        match self.store.append_message(&message).await {
            Ok(_) => self.metrics.message_persisted(),
            Err(e) => self.store_failure("append_message", &msg.session_id, &e),
        }

        let delivered = self.hub.broadcast_to_session(
            &msg.session_id,
            &ServerFrame::AgentMessage {
                text: body.to_string(),
                author: msg.author,
            },
        );
        debug!(session_id = %msg.session_id, delivered, "Agent message relayed");
    }

    /// Drain agent replies from the backend listener.
    pub fn spawn_inbound_consumer(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<InboundAgentMessage>,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                relay.handle_inbound_backend_message(msg).await;
            }
            info!("Inbound consumer stopped");
        })
    }

    // =========================================================================
    // Handle routing
    // =========================================================================

    /// The session's bound handle, creating it if the session has none.
    /// `None` when the session is unknown or closed, or the backend could not
    /// provide a handle.
    async fn ensure_session_handle(&self, session_id: &str) -> Option<String> {
        match self.store.get(session_id).await {
            Ok(Some(session)) if session.backend_handle_id.is_some() => {
                return session.backend_handle_id;
            }
            Ok(Some(_)) => {}
            Ok(None) => return None,
            Err(e) => {
                self.store_failure("get", session_id, &e);
                return None;
            }
        }

        let lock = self
            .handle_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.ensure_handle_locked(session_id).await
        };
        // Drop the lock entry once nobody else is queued on it
        self.handle_locks
            .remove_if(session_id, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn ensure_handle_locked(&self, session_id: &str) -> Option<String> {
        // Re-read under the lock: an earlier holder may have bound a handle
        let mut session = match self.store.get(session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => return None,
            Err(e) => {
                self.store_failure("get", session_id, &e);
                return None;
            }
        };
        if let Some(handle_id) = session.backend_handle_id {
            self.unbound_handles.remove(session_id);
            return Some(handle_id);
        }
        if session.closed {
            return None;
        }

        let created = match self.unbound_handles.remove(session_id) {
            Some((_, unbound)) => {
                debug!(session_id, handle_id = %unbound.handle_id, "Retrying bind of unpersisted handle");
                unbound
            }
            None => self.create_handle(session_id, &mut session).await?,
        };
        let UnboundHandle {
            handle_id,
            channel_id: resolved_channel,
            kind: used_kind,
            fell_back,
        } = created.clone();

        match self
            .store
            .bind_handle(session_id, &handle_id, &resolved_channel, used_kind)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Bound by another writer outside this process; theirs wins
                warn!(session_id, orphan = %handle_id, "Handle already bound, discarding new one");
                return match self.store.get(session_id).await {
                    Ok(Some(s)) => s.backend_handle_id,
                    Ok(None) => None,
                    Err(e) => {
                        self.store_failure("get", session_id, &e);
                        None
                    }
                };
            }
            Err(e) => {
                // Deliver this event on the new handle and keep it for the next bind attempt
                self.store_failure("bind_handle", session_id, &e);
                self.unbound_handles.insert(session_id.to_string(), created);
                return Some(handle_id);
            }
        }

        self.metrics.handle_created(fell_back);
        if fell_back {
            info!(session_id, handle_id = %handle_id, "Private handle rejected, bound public handle instead");
        } else {
            info!(session_id, handle_id = %handle_id, kind = %used_kind, "Backend handle bound");
        }

        let summary = self
            .bridge
            .post_message(&handle_id, &session_summary(&session))
            .await;
        if let support_backend::CallOutcome::Failed { reason } = summary {
            warn!(session_id, reason = reason.code(), "Failed to post session summary");
        }

        Some(handle_id)
    }

    /// Pick and bind a channel if needed, then ask the backend for a new handle.
    async fn create_handle(&self, session_id: &str, session: &mut Session) -> Option<UnboundHandle> {
        let channel_id = match session.backend_channel_id.clone() {
            Some(channel_id) => channel_id,
            None => {
                let Some(channel_id) = self.pick_channel(session) else {
                    debug!(session_id, "No support containers configured; session stays unrouted");
                    return None;
                };
                if let Err(e) = self.store.bind_channel(session_id, &channel_id).await {
                    self.store_failure("bind_channel", session_id, &e);
                }
                session.backend_channel_id = Some(channel_id.clone());
                channel_id
            }
        };

        let outcome = self
            .bridge
            .ensure_handle(&EnsureHandleRequest {
                session_id: session_id.to_string(),
                channel_id: channel_id.clone(),
                kind: self.routing.handle_kind,
                display_name: session.display_name().to_string(),
            })
            .await;

        match outcome {
            EnsureHandleOutcome::Ok {
                handle_id,
                channel_id,
                used_kind,
                fell_back,
            } => Some(UnboundHandle {
                handle_id,
                channel_id,
                kind: used_kind,
                fell_back,
            }),
            EnsureHandleOutcome::Failed { reason } => {
                self.metrics.handle_failed();
                warn!(
                    session_id,
                    channel_id = %channel_id,
                    reason = reason.code(),
                    "Backend handle unavailable: {}", reason
                );
                None
            }
        }
    }
}

#[async_trait]
impl FrameHandler for SessionRelay {
    async fn on_hello(&self, session_id: &str, payload: HelloPayload) {
        self.handle_hello(session_id, payload).await;
    }

    async fn on_visitor_message(&self, session_id: &str, text: &str) {
        self.handle_visitor_message(session_id, text).await;
    }
}
