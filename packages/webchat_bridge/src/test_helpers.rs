use std::sync::Arc;
use support_backend::{BackendBridge, BridgeConfig, HandleKind};

use crate::AppState;
use crate::config::{AdminConfig, ServerConfig, ServerFileConfig};
use crate::db::Database;
use crate::identity::TokenVerifier;
use crate::metrics::RelayMetrics;
use crate::relay::{RoutingConfig, SessionRelay};
use crate::repository::SessionRepository;
use crate::ws::TransportHub;

pub const TEST_BASE_URL: &str = "https://chat.example.com";
pub const TEST_WIDGET_SECRET: &str = "test-widget-secret";
pub const TEST_ADMIN_KEY: &str = "test-admin-key";

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
/// The support backend has no platform, so the bridge settles in `Disabled`
/// and every session stays without a handle.
pub async fn test_app_state() -> AppState {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let db = Arc::new(Database { pool: pool.clone() });
    let repository = Arc::new(SessionRepository::new(pool));
    let metrics = Arc::new(RelayMetrics::new());

    let bridge = Arc::new(BackendBridge::new(None, BridgeConfig::default()));
    bridge.start().await;

    let hub = Arc::new(TransportHub::new(metrics.clone(), 16));
    let relay = SessionRelay::new(
        repository.clone(),
        bridge.clone(),
        hub.clone(),
        RoutingConfig {
            containers: vec!["support-1".into()],
            handle_kind: HandleKind::Public,
        },
        metrics.clone(),
    );

    let server_config = ServerConfig::from_file(&ServerFileConfig {
        public_base_url: TEST_BASE_URL.into(),
        ..Default::default()
    });

    AppState {
        relay,
        hub,
        bridge,
        db,
        repository,
        verifier: Arc::new(TokenVerifier::new(Some(TEST_WIDGET_SECRET.into()), 300)),
        server_config: Arc::new(server_config),
        admin_config: Arc::new(AdminConfig {
            api_key: Some(TEST_ADMIN_KEY.into()),
        }),
        metrics,
    }
}
