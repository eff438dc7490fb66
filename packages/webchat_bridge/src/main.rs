use anyhow::{Context, Result};
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use support_backend::discord::{DiscordGateway, DiscordPlatform};
use support_backend::{BackendBridge, BridgeConfig, SupportPlatform, spawn_inbound_listener};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod handlers;
mod identity;
mod metrics;
mod models;
mod relay;
mod repository;
mod retention;
mod store;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{
    AdminConfig, BackendConfig, FileConfig, ServerConfig, TrackingConfig, WebchatConfig,
    WidgetConfig,
};
use crate::db::Database;
use crate::identity::TokenVerifier;
use crate::metrics::RelayMetrics;
use crate::relay::{RoutingConfig, SessionRelay};
use crate::repository::SessionRepository;
use crate::store::{SessionStore, StoreHandleResolver};
use crate::ws::TransportHub;

/// Buffer between the platform gateway, the inbound listener and the relay
const INBOUND_QUEUE: usize = 256;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "webchat-bridge")]
#[command(about = "Relay between website chat widgets and support threads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.webchat-bridge)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server in the foreground (default)
    Server(ServerArgs),

    /// Delete expired page views once and exit
    Sweep(SweepArgs),
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port override for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host override to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,
}

#[derive(Parser)]
struct SweepArgs {
    /// Retention in days (defaults to tracking.retention_days)
    #[arg(long)]
    days: Option<u32>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub relay: Arc<SessionRelay>,
    /// Live visitor sockets
    pub hub: Arc<TransportHub>,
    pub bridge: Arc<BackendBridge>,
    pub db: Arc<Database>,
    pub repository: Arc<SessionRepository>,
    /// Widget token verification for client sessions
    pub verifier: Arc<TokenVerifier>,
    pub server_config: Arc<ServerConfig>,
    pub admin_config: Arc<AdminConfig>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "webchat_bridge=debug,support_backend=debug,tower_http=debug,info"
    } else {
        "webchat_bridge=info,support_backend=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = WebchatConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = config::load_config(&config.data_dir, cli.config.as_deref())
        .extract()
        .context("Invalid configuration")?;

    match cli.command {
        None => run_server(ServerArgs::default(), config, file_config).await,
        Some(Commands::Server(args)) => run_server(args, config, file_config).await,
        Some(Commands::Sweep(args)) => run_sweep(args, config, file_config).await,
    }
}

async fn run_sweep(args: SweepArgs, config: WebchatConfig, file_config: FileConfig) -> Result<()> {
    let tracking = TrackingConfig::from_file(&file_config.tracking);
    let Some(days) = args.days.filter(|d| *d > 0).or(tracking.retention_days) else {
        warn!("Retention disabled (tracking.retention_days = 0); nothing to sweep");
        return Ok(());
    };

    let db = Database::new(&config).await?;
    let repository = SessionRepository::new(db.pool.clone());
    let removed = retention::sweep_page_views(&repository, days).await?;
    info!("Removed {} page views older than {} days", removed, days);
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.server_config.cors_allowed_origins);

    Router::new()
        // Session lifecycle
        .route("/api/session/start-guest", post(handlers::start_guest_session))
        .route("/api/session/start-client", post(handlers::start_client_session))
        .route("/api/session/resume", post(handlers::resume_session))
        .route("/api/session/close", post(handlers::close_session))
        .route("/api/track/page", post(handlers::track_page))
        // Visitor socket
        .route("/ws", get(handlers::visitor_websocket_handler))
        // Admin endpoints
        .route("/api/admin/sessions", get(handlers::list_sessions))
        .route("/api/admin/session/{id}", get(handlers::get_session_detail))
        .route("/api/admin/pageviews", get(handlers::list_page_views))
        .route("/api/admin/stats", get(handlers::get_database_stats))
        // Health endpoints
        .route("/healthz", get(handlers::health_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(cors)
        .with_state(state)
}

async fn run_server(args: ServerArgs, config: WebchatConfig, file_config: FileConfig) -> Result<()> {
    info!("Starting webchat bridge");

    let mut server_file = file_config.server.clone();
    if let Some(port) = args.port {
        server_file.port = port;
    }
    if let Some(host) = args.host {
        server_file.host = host;
    }
    let server_config = Arc::new(ServerConfig::from_file(&server_file));
    let backend_config = BackendConfig::from_file(&file_config.backend);
    let widget_config = WidgetConfig::from_file(&file_config.widget);
    let admin_config = Arc::new(AdminConfig::from_file(&file_config.admin));
    let tracking_config = TrackingConfig::from_file(&file_config.tracking);
    backend_config.log_warnings();
    if widget_config.hmac_secret.is_none() {
        info!("No widget secret configured; client sessions will be rejected");
    }
    if admin_config.api_key.is_none() {
        info!("No admin key configured; admin endpoints disabled");
    }

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let repository = Arc::new(SessionRepository::new(db.pool.clone()));
    let store: Arc<dyn SessionStore> = repository.clone();

    // Support backend. A missing token or failed login leaves it disabled;
    // chats are still persisted and served.
    let platform = backend_config.token.as_ref().map(|token| {
        Arc::new(DiscordPlatform::new(token.clone(), backend_config.api_base_url.clone()))
            as Arc<dyn SupportPlatform>
    });
    let bridge = Arc::new(BackendBridge::new(
        platform,
        BridgeConfig {
            allowed_channel_ids: backend_config.support_channel_ids.clone(),
            request_timeout: backend_config.request_timeout,
        },
    ));
    let backend_state = bridge.start().await;
    info!(?backend_state, "Support backend initialized");

    let metrics = Arc::new(RelayMetrics::new());
    let hub = Arc::new(TransportHub::new(
        metrics.clone(),
        server_config.send_channel_capacity,
    ));
    let relay = SessionRelay::new(
        store.clone(),
        bridge.clone(),
        hub.clone(),
        RoutingConfig {
            containers: backend_config.support_channel_ids.clone(),
            handle_kind: backend_config.handle_kind,
        },
        metrics.clone(),
    );

    // Agent replies: gateway -> listener (handle resolution) -> relay
    let (agent_tx, agent_rx) = mpsc::channel(INBOUND_QUEUE);
    let inbound_consumer = relay.spawn_inbound_consumer(agent_rx);
    let gateway_task = if bridge.is_ready().await {
        backend_config.token.as_ref().map(|token| {
            let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE);
            let gateway = DiscordGateway::new(token.clone(), backend_config.gateway_url.clone())
                .spawn(events_tx);
            let listener = spawn_inbound_listener(
                events_rx,
                Arc::new(StoreHandleResolver(store.clone())),
                agent_tx,
            );
            (gateway, listener)
        })
    } else {
        None
    };

    let sweep_task = retention::spawn_retention_sweep(repository.clone(), &tracking_config);

    let app_state = AppState {
        relay,
        hub,
        bridge,
        db,
        repository,
        verifier: Arc::new(TokenVerifier::new(
            widget_config.hmac_secret.clone(),
            widget_config.token_max_age_secs,
        )),
        server_config: server_config.clone(),
        admin_config,
        metrics,
    };
    let app = build_router(app_state);

    let addr = format!("{}:{}", server_config.host, server_config.port)
        .parse::<SocketAddr>()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                server_config.host, server_config.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Webchat bridge listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/session/start-guest   - Start a guest chat");
    info!("  POST   /api/session/start-client  - Start a chat with a signed widget token");
    info!("  POST   /api/session/resume        - Re-attach to a stored session");
    info!("  POST   /api/session/close         - End a chat");
    info!("  POST   /api/track/page            - Record a page view");
    info!("  GET    /ws                        - Visitor WebSocket");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    if let Some((gateway, listener)) = gateway_task {
        gateway.abort();
        listener.abort();
    }
    if let Some(task) = sweep_task {
        task.abort();
    }
    inbound_consumer.abort();

    info!("Shutdown complete");
    server_result
}
