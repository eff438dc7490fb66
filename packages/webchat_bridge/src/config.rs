use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use support_backend::HandleKind;
use support_backend::discord::{DEFAULT_API_BASE, DEFAULT_GATEWAY_URL};
use tracing::{info, warn};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [backend]
//                    token = "..."
//
//   env var:         WEBCHAT_BACKEND__TOKEN=...   (double underscore = nesting)
//
//   (single underscore stays within field names: WEBCHAT_WIDGET__HMAC_SECRET)

/// Value operators leave in sample configs; treated as "no token".
const TOKEN_PLACEHOLDER: &str = "PUT_YOUR_TOKEN_HERE";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub widget: WidgetFileConfig,
    #[serde(default)]
    pub admin: AdminFileConfig,
    #[serde(default)]
    pub tracking: TrackingFileConfig,
}

/// HTTP listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Echoed back to widgets so they know where to connect
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: String::new(),
            cors_allowed_origins: Vec::new(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Support platform settings (lives under `[backend]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Containers sessions are routed into. Also the creation allow-list.
    #[serde(default, deserialize_with = "string_or_list")]
    pub support_channel_ids: Vec<String>,
    #[serde(default)]
    pub thread_type: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base_url: default_api_base_url(),
            gateway_url: default_gateway_url(),
            support_channel_ids: Vec::new(),
            thread_type: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Signed widget token settings (lives under `[widget]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WidgetFileConfig {
    #[serde(default)]
    pub hmac_secret: String,
    #[serde(default = "default_token_max_age_secs")]
    pub token_max_age_secs: u64,
}

impl Default for WidgetFileConfig {
    fn default() -> Self {
        Self {
            hmac_secret: String::new(),
            token_max_age_secs: default_token_max_age_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdminFileConfig {
    #[serde(default)]
    pub api_key: String,
}

/// Page-view retention (lives under `[tracking]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingFileConfig {
    /// 0 disables the sweep
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TrackingFileConfig {
    fn default() -> Self {
        Self {
            retention_days: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_send_channel_capacity() -> usize {
    64
}
fn default_api_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}
fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_token_max_age_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    6 * 60 * 60
}

/// Accept either a TOML list or a comma-separated string (the form env vars take).
/// Bare numbers are accepted too since snowflake ids parse as integers.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Item {
        Text(String),
        Number(u64),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<Item>),
        One(Item),
    }

    let items: Vec<String> = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items
            .into_iter()
            .map(|item| match item {
                Item::Text(s) => s,
                Item::Number(n) => n.to_string(),
            })
            .collect(),
        Raw::One(Item::Text(s)) => s.split(',').map(str::to_string).collect(),
        Raw::One(Item::Number(n)) => vec![n.to_string()],
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Build a figment that layers: defaults → config.toml → WEBCHAT_* env vars.
///
/// `config_file` overrides the default `<data_dir>/config.toml` location.
///
/// Env vars use double-underscore for nesting into sections:
///   `WEBCHAT_BACKEND__TOKEN=abc`  →  `backend.token = "abc"`
///   `WEBCHAT_SERVER__PORT=8080`   →  `server.port = 8080`
pub fn load_config(data_dir: &Path, config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join("config.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("WEBCHAT_").split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    /// Empty means permissive CORS
    pub cors_allowed_origins: Vec<String>,
    pub send_channel_capacity: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            public_base_url: fc.public_base_url.trim_end_matches('/').to_string(),
            cors_allowed_origins: fc.cors_allowed_origins.clone(),
            send_channel_capacity: fc.send_channel_capacity.max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// `None` when unset or still the sample placeholder
    pub token: Option<String>,
    pub api_base_url: String,
    pub gateway_url: String,
    pub support_channel_ids: Vec<String>,
    pub handle_kind: HandleKind,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn from_file(fc: &BackendFileConfig) -> Self {
        let token = fc.token.trim();
        let token = (!token.is_empty() && token != TOKEN_PLACEHOLDER).then(|| token.to_string());

        Self {
            token,
            api_base_url: fc.api_base_url.clone(),
            gateway_url: fc.gateway_url.clone(),
            support_channel_ids: fc.support_channel_ids.clone(),
            handle_kind: HandleKind::parse(&fc.thread_type),
            request_timeout: Duration::from_secs(fc.request_timeout_secs.max(1)),
        }
    }

    /// Boot-time sanity checks. Problems are logged, never fatal.
    pub fn log_warnings(&self) {
        if self.token.is_none() {
            warn!("No backend token configured (WEBCHAT_BACKEND__TOKEN); support backend will be disabled");
        }
        if self.support_channel_ids.is_empty() {
            warn!("No support channels configured (WEBCHAT_BACKEND__SUPPORT_CHANNEL_IDS); sessions cannot be routed");
        }
    }
}

#[derive(Clone, Debug)]
pub struct WidgetConfig {
    /// `None` disables signed (client) sessions
    pub hmac_secret: Option<String>,
    pub token_max_age_secs: i64,
}

impl WidgetConfig {
    pub fn from_file(fc: &WidgetFileConfig) -> Self {
        let secret = fc.hmac_secret.trim();
        Self {
            hmac_secret: (!secret.is_empty()).then(|| secret.to_string()),
            token_max_age_secs: i64::try_from(fc.token_max_age_secs).unwrap_or(i64::MAX),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdminConfig {
    /// `None` disables the admin surface
    pub api_key: Option<String>,
}

impl AdminConfig {
    pub fn from_file(fc: &AdminFileConfig) -> Self {
        let key = fc.api_key.trim();
        Self {
            api_key: (!key.is_empty()).then(|| key.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackingConfig {
    /// `None` disables the retention sweep
    pub retention_days: Option<u32>,
    pub sweep_interval: Duration,
}

impl TrackingConfig {
    pub fn from_file(fc: &TrackingFileConfig) -> Self {
        Self {
            retention_days: (fc.retention_days > 0).then_some(fc.retention_days),
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs.max(60)),
        }
    }
}

// =============================================================================
// Filesystem layout
// =============================================================================

#[derive(Clone, Debug)]
pub struct WebchatConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl WebchatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("Could not find home directory"))?
                .join(".webchat-bridge"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("webchat.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
