use super::*;
use anyhow::{Result, anyhow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use support_backend::testing::FakePlatform;
use support_backend::{BridgeConfig, SupportPlatform, handle_display_name};

use crate::models::{PageView, TrackingUpdate};
use crate::repository::SessionRepository;
use crate::repository::test_helpers::test_repository;
use crate::ws::LiveConnection;

const SUPPORT: &str = "support-1";

/// Delegates to the real repository, with switchable failures.
struct FlakyStore {
    inner: SessionRepository,
    fail_appends: AtomicBool,
    fail_binds: AtomicBool,
}

impl FlakyStore {
    fn new(inner: SessionRepository) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_binds: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        SessionStore::get(&self.inner, session_id).await
    }

    async fn upsert(&self, session: &Session) -> Result<()> {
        SessionStore::upsert(&self.inner, session).await
    }

    async fn bind_channel(&self, session_id: &str, channel_id: &str) -> Result<bool> {
        SessionStore::bind_channel(&self.inner, session_id, channel_id).await
    }

    async fn bind_handle(
        &self,
        session_id: &str,
        handle_id: &str,
        channel_id: &str,
        kind: HandleKind,
    ) -> Result<bool> {
        if self.fail_binds.load(Ordering::SeqCst) {
            return Err(anyhow!("disk I/O error"));
        }
        SessionStore::bind_handle(&self.inner, session_id, handle_id, channel_id, kind).await
    }

    async fn fill_identity(&self, session_id: &str, patch: &IdentityPatch) -> Result<()> {
        SessionStore::fill_identity(&self.inner, session_id, patch).await
    }

    async fn record_identity(
        &self,
        session_id: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        SessionStore::record_identity(&self.inner, session_id, name, email).await
    }

    async fn update_tracking(&self, session_id: &str, update: &TrackingUpdate) -> Result<()> {
        SessionStore::update_tracking(&self.inner, session_id, update).await
    }

    async fn mark_closed(&self, session_id: &str) -> Result<bool> {
        SessionStore::mark_closed(&self.inner, session_id).await
    }

    async fn append_message(&self, message: &Message) -> Result<i64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        SessionStore::append_message(&self.inner, message).await
    }

    async fn transcript(&self, session_id: &str) -> Result<Vec<Message>> {
        SessionStore::transcript(&self.inner, session_id).await
    }

    async fn find_session_by_handle(&self, handle_id: &str) -> Result<Option<String>> {
        SessionStore::find_session_by_handle(&self.inner, handle_id).await
    }

    async fn record_page_view(&self, view: &PageView) -> Result<i64> {
        SessionStore::record_page_view(&self.inner, view).await
    }
}

struct Harness {
    relay: Arc<SessionRelay>,
    repo: SessionRepository,
    store: Arc<FlakyStore>,
    platform: Arc<FakePlatform>,
    hub: Arc<TransportHub>,
    metrics: Arc<RelayMetrics>,
}

impl Harness {
    async fn session(&self, id: &str) -> Session {
        self.repo.get_session(id).await.unwrap().unwrap()
    }

    async fn bodies(&self, id: &str, direction: Direction) -> Vec<String> {
        self.repo
            .transcript(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.direction == direction)
            .map(|m| m.body)
            .collect()
    }

    /// Insert a row as if it had been created while the backend was down.
    async fn seed_session(&self, id: &str, channel: Option<&str>) {
        let mut s = Session::new(id.to_string(), SessionMode::Guest);
        s.visitor_name = Some("Ann".into());
        s.backend_channel_id = channel.map(str::to_string);
        self.repo.upsert_session(&s).await.unwrap();
    }

    fn connect(&self, session_id: &str) -> (Arc<LiveConnection>, mpsc::Receiver<Arc<String>>) {
        let (conn, rx) = self.hub.register();
        self.hub.attach(&conn, session_id);
        (conn, rx)
    }
}

async fn setup_with(
    kind: HandleKind,
    containers: &[&str],
    platform: Option<FakePlatform>,
) -> Harness {
    let repo = test_repository().await;
    let store = Arc::new(FlakyStore::new(repo.clone()));
    let connected = platform.is_some();
    let platform = Arc::new(platform.unwrap_or_default());
    let containers: Vec<String> = containers.iter().map(|c| c.to_string()).collect();

    let bridge = BackendBridge::new(
        connected.then(|| platform.clone() as Arc<dyn SupportPlatform>),
        BridgeConfig {
            allowed_channel_ids: containers.clone(),
            ..Default::default()
        },
    );
    bridge.start().await;

    let metrics = Arc::new(RelayMetrics::new());
    let hub = Arc::new(TransportHub::new(metrics.clone(), 16));
    let relay = SessionRelay::new(
        store.clone(),
        Arc::new(bridge),
        hub.clone(),
        RoutingConfig {
            containers,
            handle_kind: kind,
        },
        metrics.clone(),
    );

    Harness {
        relay,
        repo,
        store,
        platform,
        hub,
        metrics,
    }
}

async fn setup() -> Harness {
    setup_with(
        HandleKind::Public,
        &[SUPPORT],
        Some(FakePlatform::new().with_text_channel(SUPPORT)),
    )
    .await
}

fn guest(name: &str) -> StartSessionRequest {
    StartSessionRequest {
        kind: SessionKind::Guest,
        context: VisitorContext {
            visitor_name: Some(name.into()),
            entry_url: Some("https://example.com/pricing".into()),
            ..Default::default()
        },
    }
}

fn next_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Option<serde_json::Value> {
    rx.try_recv()
        .ok()
        .map(|json| serde_json::from_str(&json).unwrap())
}

// ── session ids ─────────────────────────────────────────────────────────

#[test]
fn session_ids_are_url_safe_and_unique() {
    let a = new_session_id();
    let b = new_session_id();
    assert_eq!(a.len(), 24);
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    assert_ne!(a, b);
}

// ── start ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_binds_handle_and_posts_summary() {
    let h = setup().await;

    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    assert!(ticket.handle_ready);

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.mode, SessionMode::Guest);
    assert_eq!(s.backend_channel_id.as_deref(), Some(SUPPORT));
    assert_eq!(s.backend_handle_id.as_deref(), Some("thread-1"));
    assert_eq!(s.handle_kind, Some(HandleKind::Public));

    let created = h.platform.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].name, handle_display_name("Ann", &ticket.session_id));

    let sent = h.platform.sent_to("thread-1");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("**New Live Chat Session**"));
    assert!(sent[0].contains(&ticket.session_id));
    assert!(sent[0].contains("Entry: https://example.com/pricing"));
    assert!(!sent[0].contains("Authenticated"));
}

#[tokio::test]
async fn start_succeeds_while_backend_disabled() {
    let h = setup_with(HandleKind::Public, &[SUPPORT], None).await;

    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    assert!(!ticket.handle_ready);

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.backend_channel_id.as_deref(), Some(SUPPORT));
    assert_eq!(s.backend_handle_id, None);
    assert_eq!(h.metrics.snapshot().handles.failures, 1);
}

#[tokio::test]
async fn authenticated_start_trusts_verified_identity() {
    let h = setup().await;
    let identity = VerifiedIdentity {
        client_id: Some("42".into()),
        name: Some("Ann Lee".into()),
        email: Some("ann@example.com".into()),
        logged_in: true,
        iat: 0,
    };
    let ticket = h
        .relay
        .start_session(StartSessionRequest {
            kind: SessionKind::Authenticated(identity),
            context: VisitorContext {
                visitor_name: Some("typed name".into()),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.mode, SessionMode::Authenticated);
    assert_eq!(s.client_id.as_deref(), Some("42"));
    assert_eq!(s.visitor_name.as_deref(), Some("Ann Lee"));

    let summary = &h.platform.sent_to("thread-1")[0];
    assert!(summary.contains("Authenticated: **Yes**"));
    assert!(summary.contains("Client ID: #42"));
    assert!(summary.contains("Visitor: **Ann Lee** <ann@example.com>"));
}

#[tokio::test]
async fn logged_out_identity_starts_without_client_id() {
    let h = setup().await;
    let identity = VerifiedIdentity {
        client_id: Some("42".into()),
        logged_in: false,
        ..Default::default()
    };
    let ticket = h
        .relay
        .start_session(StartSessionRequest {
            kind: SessionKind::Authenticated(identity),
            context: VisitorContext::default(),
        })
        .await
        .unwrap();

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.mode, SessionMode::Guest);
    assert_eq!(s.client_id, None);
}

#[tokio::test]
async fn no_containers_leaves_session_unrouted() {
    let h = setup_with(
        HandleKind::Public,
        &[],
        Some(FakePlatform::new().with_text_channel(SUPPORT)),
    )
    .await;

    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    h.relay
        .handle_visitor_message(&ticket.session_id, "anyone there?")
        .await;

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.routing_state(), crate::models::RoutingState::New);
    assert_eq!(h.platform.create_calls(), 0);
    assert_eq!(
        h.bodies(&ticket.session_id, Direction::Visitor).await,
        vec!["anyone there?"]
    );
}

// ── round trip ──────────────────────────────────────────────────────────

#[tokio::test]
async fn visitor_and_agent_messages_round_trip() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let other = h.relay.start_session(guest("Bob")).await.unwrap();
    let sid = ticket.session_id.as_str();

    h.relay.handle_visitor_message(sid, "hello").await;
    assert_eq!(h.bodies(sid, Direction::Visitor).await, vec!["hello"]);
    assert!(
        h.platform
            .sent_to("thread-1")
            .contains(&"**Visitor:** hello".to_string())
    );

    let (_a, mut rx_a) = h.connect(sid);
    let (_b, mut rx_b) = h.connect(sid);
    let (_c, mut rx_c) = h.connect(&other.session_id);

    h.relay
        .handle_inbound_backend_message(InboundAgentMessage {
            session_id: sid.to_string(),
            author: "Kim".into(),
            body: "Hi Ann, how can I help?".into(),
        })
        .await;

    let transcript = h.repo.transcript(sid).await.unwrap();
    let agent: Vec<_> = transcript
        .iter()
        .filter(|m| m.direction == Direction::Agent)
        .collect();
    assert_eq!(agent.len(), 1);
    assert_eq!(agent[0].author.as_deref(), Some("Kim"));
    assert_eq!(agent[0].body, "Hi Ann, how can I help?");

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = next_frame(rx).unwrap();
        assert_eq!(frame["type"], "agent_message");
        assert_eq!(frame["author"], "Kim");
        assert_eq!(frame["text"], "Hi Ann, how can I help?");
    }
    assert!(next_frame(&mut rx_c).is_none());
}

#[tokio::test]
async fn blank_messages_are_ignored() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let sent_before = h.platform.sent().len();

    h.relay.handle_visitor_message(&ticket.session_id, "").await;
    h.relay.handle_visitor_message(&ticket.session_id, "   ").await;

    assert!(h.repo.transcript(&ticket.session_id).await.unwrap().is_empty());
    assert_eq!(h.platform.sent().len(), sent_before);
    assert_eq!(h.platform.create_calls(), 1);
}

#[tokio::test]
async fn messages_persist_while_backend_disabled() {
    let h = setup_with(HandleKind::Public, &[SUPPORT], None).await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();

    h.relay
        .handle_visitor_message(&ticket.session_id, "is anyone there?")
        .await;

    assert_eq!(
        h.bodies(&ticket.session_id, Direction::Visitor).await,
        vec!["is anyone there?"]
    );
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.messages.persisted, 1);
    assert_eq!(snapshot.messages.delivery_failed, 1);
}

#[tokio::test]
async fn persistence_failure_does_not_block_delivery() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    h.store.fail_appends.store(true, Ordering::SeqCst);

    h.relay
        .handle_visitor_message(&ticket.session_id, "still there?")
        .await;

    assert!(
        h.platform
            .sent_to("thread-1")
            .contains(&"**Visitor:** still there?".to_string())
    );
    assert_eq!(h.metrics.snapshot().errors.store, 1);
    assert_eq!(h.metrics.snapshot().messages.delivered, 1);
}

#[tokio::test]
async fn delivery_failure_does_not_block_persistence() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    h.platform.fail_sends();

    h.relay.handle_visitor_message(&ticket.session_id, "hello?").await;

    assert_eq!(
        h.bodies(&ticket.session_id, Direction::Visitor).await,
        vec!["hello?"]
    );
    assert_eq!(h.metrics.snapshot().messages.delivery_failed, 1);
}

#[tokio::test]
async fn identity_hints_backfill_session() {
    let h = setup().await;
    let ticket = h
        .relay
        .start_session(StartSessionRequest {
            kind: SessionKind::Guest,
            context: VisitorContext::default(),
        })
        .await
        .unwrap();
    let sid = ticket.session_id.as_str();

    h.relay.handle_visitor_message(sid, "My name is Carla").await;
    h.relay
        .handle_visitor_message(sid, "you can reach me at carla@example.com")
        .await;

    let s = h.session(sid).await;
    assert_eq!(s.visitor_name.as_deref(), Some("Carla"));
    assert_eq!(s.visitor_email.as_deref(), Some("carla@example.com"));
}

// ── handle invariants ───────────────────────────────────────────────────

#[tokio::test]
async fn resume_repairs_missing_handle_once() {
    let h = setup().await;
    h.seed_session("s-repair", Some(SUPPORT)).await;

    let ticket = h
        .relay
        .resume_session("s-repair", VisitorContext::default())
        .await
        .unwrap();
    assert!(ticket.handle_ready);
    assert_eq!(h.platform.create_calls(), 1);
    assert_eq!(
        h.session("s-repair").await.backend_handle_id.as_deref(),
        Some("thread-1")
    );

    // Handle-bound resumes do no handle work
    h.relay
        .resume_session("s-repair", VisitorContext::default())
        .await
        .unwrap();
    assert_eq!(h.platform.create_calls(), 1);
}

#[tokio::test]
async fn resume_unknown_session_fails() {
    let h = setup().await;
    let err = h
        .relay
        .resume_session("nope", VisitorContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownSession));
    assert!(h.repo.get_session("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn resume_fills_missing_context() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;

    h.relay
        .resume_session(
            "s1",
            VisitorContext {
                visitor_id: Some("v-9".into()),
                visitor_name: Some("Someone Else".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let s = h.session("s1").await;
    assert_eq!(s.visitor_id.as_deref(), Some("v-9"));
    assert_eq!(s.visitor_name.as_deref(), Some("Ann"));
}

#[tokio::test]
async fn concurrent_attempts_create_one_handle() {
    let h = setup().await;
    h.seed_session("s-race", Some(SUPPORT)).await;
    h.platform.set_create_delay(Duration::from_millis(50));

    let sends = (0..5).map(|i| {
        let relay = h.relay.clone();
        async move {
            relay
                .handle_visitor_message("s-race", &format!("m{}", i))
                .await
        }
    });
    let resume = h.relay.resume_session("s-race", VisitorContext::default());
    let (_, resumed) = tokio::join!(futures::future::join_all(sends), resume);

    assert!(resumed.unwrap().handle_ready);
    assert_eq!(h.platform.create_calls(), 1);

    let posted: Vec<String> = h
        .platform
        .sent_to("thread-1")
        .into_iter()
        .filter(|m| m.starts_with("**Visitor:**"))
        .collect();
    assert_eq!(posted.len(), 5);
    assert!(h.platform.sent().iter().all(|(ch, _)| ch == "thread-1"));
}

#[tokio::test]
async fn bound_handle_never_changes() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let sid = ticket.session_id.as_str();

    // Handle disappears on the platform side: posts fail, binding stays
    h.platform.remove_channel("thread-1");
    h.relay.handle_visitor_message(sid, "one").await;
    h.relay
        .resume_session(sid, VisitorContext::default())
        .await
        .unwrap();
    h.relay
        .handle_hello(sid, HelloPayload::default())
        .await;
    h.relay.handle_visitor_message(sid, "two").await;

    assert_eq!(h.session(sid).await.backend_handle_id.as_deref(), Some("thread-1"));
    assert_eq!(h.platform.create_calls(), 1);
    assert_eq!(h.metrics.snapshot().messages.delivery_failed, 2);
}

#[tokio::test]
async fn rejected_private_handle_falls_back_to_public() {
    let platform = FakePlatform::new().with_text_channel(SUPPORT);
    platform.reject_private_threads();
    let h = setup_with(HandleKind::Private, &[SUPPORT], Some(platform)).await;

    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();

    let s = h.session(&ticket.session_id).await;
    assert_eq!(s.backend_handle_id.as_deref(), Some("thread-1"));
    assert_eq!(s.handle_kind, Some(HandleKind::Public));
    assert_eq!(h.platform.create_calls(), 2);
    assert_eq!(h.metrics.snapshot().handles.fallbacks, 1);
}

#[tokio::test]
async fn rejected_creation_is_retried_on_next_event() {
    let platform = FakePlatform::new().with_text_channel(SUPPORT);
    platform.reject_thread_creation();
    let h = setup_with(HandleKind::Public, &[SUPPORT], Some(platform)).await;

    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    assert!(!ticket.handle_ready);
    assert_eq!(h.platform.create_calls(), 1);

    h.relay
        .handle_visitor_message(&ticket.session_id, "hello")
        .await;
    assert_eq!(h.platform.create_calls(), 2);
    assert_eq!(h.session(&ticket.session_id).await.backend_handle_id, None);
    assert_eq!(
        h.bodies(&ticket.session_id, Direction::Visitor).await,
        vec!["hello"]
    );
}

#[tokio::test]
async fn unpersisted_handle_still_delivers_current_message() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;
    h.store.fail_binds.store(true, Ordering::SeqCst);

    h.relay.handle_visitor_message("s1", "hi").await;

    assert!(
        h.platform
            .sent_to("thread-1")
            .contains(&"**Visitor:** hi".to_string())
    );
    assert_eq!(h.session("s1").await.backend_handle_id, None);
    assert_eq!(h.metrics.snapshot().errors.store, 1);

    // Once binds recover the same handle is persisted, not a second one
    h.store.fail_binds.store(false, Ordering::SeqCst);
    h.relay.handle_visitor_message("s1", "two").await;

    assert_eq!(h.platform.create_calls(), 1);
    assert_eq!(
        h.session("s1").await.backend_handle_id.as_deref(),
        Some("thread-1")
    );
    let sent = h.platform.sent_to("thread-1");
    assert!(sent.contains(&"**Visitor:** two".to_string()));
    assert!(sent.iter().any(|m| m.starts_with("**New Live Chat Session**")));
}

#[tokio::test]
async fn close_archives_unpersisted_handle() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;
    h.store.fail_binds.store(true, Ordering::SeqCst);
    h.relay.handle_visitor_message("s1", "hi").await;

    h.relay.close_session("s1").await.unwrap();

    assert_eq!(h.platform.create_calls(), 1);
    assert_eq!(h.platform.archived(), vec!["thread-1".to_string()]);
}

// ── hello ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn hello_fills_only_empty_fields() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;

    h.relay
        .handle_hello(
            "s1",
            HelloPayload {
                visitor_name: Some("Bob".into()),
                visitor_email: Some("ann@example.com".into()),
                ..Default::default()
            },
        )
        .await;
    h.relay
        .handle_hello("s1", HelloPayload::default())
        .await;

    let s = h.session("s1").await;
    assert_eq!(s.visitor_name.as_deref(), Some("Ann"));
    assert_eq!(s.visitor_email.as_deref(), Some("ann@example.com"));
}

#[tokio::test]
async fn hello_for_unknown_session_creates_nothing() {
    let h = setup().await;
    h.relay
        .handle_hello(
            "ghost",
            HelloPayload {
                visitor_name: Some("Ann".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(h.repo.get_session("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn hello_binds_channel_without_creating_handle() {
    let h = setup().await;
    h.seed_session("s-new", None).await;

    h.relay
        .handle_hello("s-new", HelloPayload::default())
        .await;

    let s = h.session("s-new").await;
    assert_eq!(s.backend_channel_id.as_deref(), Some(SUPPORT));
    assert_eq!(s.backend_handle_id, None);
    assert_eq!(h.platform.create_calls(), 0);
}

#[tokio::test]
async fn hub_frames_reach_the_relay() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let sid = ticket.session_id.as_str();
    let (conn, mut rx) = h.hub.register();

    h.hub
        .handle_text(
            &conn,
            &format!(
                r#"{{"type":"hello","sessionUuid":"{}","payload":{{"visitorEmail":"ann@example.com"}}}}"#,
                sid
            ),
        )
        .await;
    h.hub
        .handle_text(&conn, r#"{"type":"visitor_message","text":" need help "}"#)
        .await;

    assert_eq!(next_frame(&mut rx).unwrap()["type"], "hello_ack");
    assert_eq!(
        h.session(sid).await.visitor_email.as_deref(),
        Some("ann@example.com")
    );
    assert_eq!(h.bodies(sid, Direction::Visitor).await, vec!["need help"]);
}

// ── close ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_archives_and_notifies_once() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let sid = ticket.session_id.as_str();
    let (_conn, mut rx) = h.connect(sid);

    h.relay.close_session(sid).await.unwrap();
    h.relay.close_session(sid).await.unwrap();

    let s = h.session(sid).await;
    assert!(s.closed);
    assert_eq!(h.bodies(sid, Direction::System).await, vec![CLOSED_BY_VISITOR]);
    assert_eq!(h.platform.archived(), vec!["thread-1".to_string()]);

    let frame = next_frame(&mut rx).unwrap();
    assert_eq!(frame["type"], "system");
    assert_eq!(frame["text"], CLOSED_BY_VISITOR);
    assert!(next_frame(&mut rx).is_none());
    assert_eq!(h.metrics.snapshot().sessions.closed, 1);
}

#[tokio::test]
async fn close_without_handle_skips_archive() {
    let h = setup_with(HandleKind::Public, &[SUPPORT], None).await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();

    h.relay.close_session(&ticket.session_id).await.unwrap();

    assert!(h.session(&ticket.session_id).await.closed);
    assert!(h.platform.archived().is_empty());
}

#[tokio::test]
async fn close_unknown_session_fails() {
    let h = setup().await;
    assert!(matches!(
        h.relay.close_session("nope").await,
        Err(RelayError::UnknownSession)
    ));
}

#[tokio::test]
async fn closed_session_gets_no_new_handle() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;
    h.relay.close_session("s1").await.unwrap();

    h.relay.handle_visitor_message("s1", "one more thing").await;

    assert_eq!(h.platform.create_calls(), 0);
    assert_eq!(
        h.bodies("s1", Direction::Visitor).await,
        vec!["one more thing"]
    );
}

// ── inbound ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbound_consumer_drains_channel() {
    let h = setup().await;
    let ticket = h.relay.start_session(guest("Ann")).await.unwrap();
    let (tx, rx) = mpsc::channel(8);
    let task = h.relay.spawn_inbound_consumer(rx);

    tx.send(InboundAgentMessage {
        session_id: ticket.session_id.clone(),
        author: "Kim".into(),
        body: "On it".into(),
    })
    .await
    .unwrap();
    tx.send(InboundAgentMessage {
        session_id: ticket.session_id.clone(),
        author: "Kim".into(),
        body: "   ".into(),
    })
    .await
    .unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(
        h.bodies(&ticket.session_id, Direction::Agent).await,
        vec!["On it"]
    );
    assert_eq!(h.metrics.snapshot().messages.from_agents, 1);
}

// ── tracking ────────────────────────────────────────────────────────────

#[tokio::test]
async fn page_tracking_updates_session_telemetry() {
    let h = setup().await;
    h.seed_session("s1", Some(SUPPORT)).await;

    h.relay
        .track_page(PageView {
            session_id: Some("s1".into()),
            visitor_id: Some("v-1".into()),
            url: "https://example.com/docs".into(),
            created_at: 1_700_000_000_000,
            ..Default::default()
        })
        .await
        .unwrap();
    h.relay
        .track_page(PageView {
            url: "https://example.com/anonymous".into(),
            created_at: 1_700_000_000_500,
            ..Default::default()
        })
        .await
        .unwrap();

    let s = h.session("s1").await;
    assert_eq!(s.last_page_url.as_deref(), Some("https://example.com/docs"));
    assert_eq!(s.last_seen_at, Some(1_700_000_000_000));
    assert_eq!(s.visitor_id.as_deref(), Some("v-1"));
    assert_eq!(h.repo.page_views_for_session("s1", None, 10).await.unwrap().len(), 1);
    assert_eq!(h.repo.recent_page_views(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn blank_ids_and_urls_are_invalid() {
    let h = setup().await;

    assert!(matches!(
        h.relay.resume_session(" ", VisitorContext::default()).await,
        Err(RelayError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.relay.close_session("").await,
        Err(RelayError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.relay.track_page(PageView::default()).await,
        Err(RelayError::InvalidRequest(_))
    ));
    assert!(h.repo.recent_page_views(10).await.unwrap().is_empty());
}
