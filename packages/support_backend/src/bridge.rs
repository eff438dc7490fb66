use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::PlatformError;
use crate::platform::{ChannelKind, HandleKind, SupportPlatform};

/// Platform limit on conversation handle names.
pub const MAX_HANDLE_NAME_LEN: usize = 100;

const MAX_VISITOR_NAME_LEN: usize = 60;
const SESSION_SUFFIX_LEN: usize = 8;

/// Connectivity lifecycle of the bridge.
///
/// `Uninitialized -> Ready` or `Uninitialized -> Disabled`. There is no way
/// back to `Ready` short of a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeState {
    Uninitialized,
    Ready,
    Disabled { reason: String },
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Containers handles may be created under. Empty allows any.
    pub allowed_channel_ids: Vec<String>,
    /// Upper bound on every platform call
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            allowed_channel_ids: Vec::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a bridge operation did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("backend disabled")]
    BackendDisabled,
    #[error("container not found")]
    ContainerNotFound,
    #[error("container not permitted")]
    ContainerNotPermitted,
    #[error("container is not a valid creation target")]
    ContainerNotCreatable,
    #[error("handle creation rejected: {0}")]
    CreationRejected(String),
    #[error("handle not found")]
    HandleNotFound,
    #[error("send rejected: {0}")]
    SendRejected(String),
    #[error("backend call timed out")]
    TimedOut,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl FailureReason {
    /// Stable machine-readable code for logs and JSON.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::BackendDisabled => "backend_disabled",
            FailureReason::ContainerNotFound => "container_not_found",
            FailureReason::ContainerNotPermitted => "container_not_permitted",
            FailureReason::ContainerNotCreatable => "container_not_creatable",
            FailureReason::CreationRejected(_) => "creation_rejected",
            FailureReason::HandleNotFound => "handle_not_found",
            FailureReason::SendRejected(_) => "send_rejected",
            FailureReason::TimedOut => "timed_out",
            FailureReason::Unavailable(_) => "unavailable",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EnsureHandleRequest {
    pub session_id: String,
    pub channel_id: String,
    pub kind: HandleKind,
    /// Visitor name; the bridge derives the platform handle name from it.
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnsureHandleOutcome {
    Ok {
        handle_id: String,
        channel_id: String,
        used_kind: HandleKind,
        /// A private request was downgraded to public
        fell_back: bool,
    },
    Failed {
        reason: FailureReason,
    },
}

/// Result of a fire-once call (post, archive).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Failed { reason: FailureReason },
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok)
    }
}

enum CallFailure {
    TimedOut,
    Platform(PlatformError),
}

impl CallFailure {
    fn into_reason(self, rejected: fn(String) -> FailureReason, not_found: FailureReason) -> FailureReason {
        match self {
            CallFailure::TimedOut => FailureReason::TimedOut,
            CallFailure::Platform(PlatformError::NotFound) => not_found,
            CallFailure::Platform(e @ PlatformError::Transport(_))
            | CallFailure::Platform(e @ PlatformError::Gateway(_)) => {
                FailureReason::Unavailable(e.to_string())
            }
            CallFailure::Platform(e) => rejected(e.to_string()),
        }
    }
}

/// Wraps a [`SupportPlatform`] so the rest of the system keeps running
/// regardless of backend outages.
pub struct BackendBridge {
    platform: Option<Arc<dyn SupportPlatform>>,
    config: BridgeConfig,
    state: RwLock<BridgeState>,
}

impl BackendBridge {
    /// `platform` is `None` when credentials are not configured; `start`
    /// will then settle in `Disabled`.
    pub fn new(platform: Option<Arc<dyn SupportPlatform>>, config: BridgeConfig) -> Self {
        Self {
            platform,
            config,
            state: RwLock::new(BridgeState::Uninitialized),
        }
    }

    /// Authenticate with the platform. Never fails: a bad token, network
    /// error or missing configuration leaves the bridge `Disabled`.
    pub async fn start(&self) -> BridgeState {
        let mut state = self.state.write().await;
        if *state != BridgeState::Uninitialized {
            return state.clone();
        }

        let next = match &self.platform {
            None => {
                let reason = "backend credentials missing".to_string();
                warn!(%reason, "Support backend disabled");
                BridgeState::Disabled { reason }
            }
            Some(platform) => {
                match tokio::time::timeout(self.config.request_timeout, platform.authenticate())
                    .await
                {
                    Ok(Ok(tag)) => {
                        info!(user = %tag, "Support backend ready");
                        BridgeState::Ready
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Support backend disabled: login failed");
                        BridgeState::Disabled {
                            reason: e.to_string(),
                        }
                    }
                    Err(_) => {
                        error!("Support backend disabled: login timed out");
                        BridgeState::Disabled {
                            reason: "login timed out".to_string(),
                        }
                    }
                }
            }
        };

        *state = next.clone();
        next
    }

    pub async fn state(&self) -> BridgeState {
        self.state.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == BridgeState::Ready
    }

    fn channel_allowed(&self, channel_id: &str) -> bool {
        self.config.allowed_channel_ids.is_empty()
            || self.config.allowed_channel_ids.iter().any(|c| c == channel_id)
    }

    async fn ready_platform(&self) -> Option<Arc<dyn SupportPlatform>> {
        if self.is_ready().await {
            self.platform.clone()
        } else {
            None
        }
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, CallFailure>
    where
        F: Future<Output = Result<T, PlatformError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(op, error = %e, "Platform call failed");
                Err(CallFailure::Platform(e))
            }
            Err(_) => {
                warn!(op, timeout_ms = self.config.request_timeout.as_millis() as u64, "Platform call timed out");
                Err(CallFailure::TimedOut)
            }
        }
    }

    /// Resolve `channel_id` to a conversation handle, creating one under it
    /// when it is a container. A rejected private creation is retried once
    /// as public and reported through `fell_back`.
    pub async fn ensure_handle(&self, req: &EnsureHandleRequest) -> EnsureHandleOutcome {
        let failed = |reason| EnsureHandleOutcome::Failed { reason };

        let Some(platform) = self.ready_platform().await else {
            return failed(FailureReason::BackendDisabled);
        };
        if !self.channel_allowed(&req.channel_id) {
            return failed(FailureReason::ContainerNotPermitted);
        }

        let channel = match self
            .call("fetch_channel", platform.fetch_channel(&req.channel_id))
            .await
        {
            Ok(Some(channel)) => channel,
            Ok(None) => return failed(FailureReason::ContainerNotFound),
            Err(e) => {
                return failed(e.into_reason(FailureReason::Unavailable, FailureReason::ContainerNotFound));
            }
        };

        if channel.kind.is_handle() {
            let used_kind = if channel.kind == ChannelKind::PrivateThread {
                HandleKind::Private
            } else {
                HandleKind::Public
            };
            return EnsureHandleOutcome::Ok {
                channel_id: channel.parent_id.unwrap_or_else(|| req.channel_id.clone()),
                handle_id: channel.id,
                used_kind,
                fell_back: false,
            };
        }
        if channel.kind != ChannelKind::Text {
            return failed(FailureReason::ContainerNotCreatable);
        }

        let name = handle_display_name(&req.display_name, &req.session_id);
        let first = self
            .call("create_thread", platform.create_thread(&channel.id, &name, req.kind))
            .await;

        match first {
            Ok(handle_id) => EnsureHandleOutcome::Ok {
                handle_id,
                channel_id: channel.id,
                used_kind: req.kind,
                fell_back: false,
            },
            // A timed-out private attempt may still have landed; do not risk a second handle.
            Err(CallFailure::Platform(e)) if req.kind == HandleKind::Private => {
                warn!(
                    session_id = %req.session_id,
                    error = %e,
                    "Private handle creation failed, falling back to public"
                );
                match self
                    .call("create_thread", platform.create_thread(&channel.id, &name, HandleKind::Public))
                    .await
                {
                    Ok(handle_id) => EnsureHandleOutcome::Ok {
                        handle_id,
                        channel_id: channel.id,
                        used_kind: HandleKind::Public,
                        fell_back: true,
                    },
                    Err(e) => failed(e.into_reason(FailureReason::CreationRejected, FailureReason::ContainerNotFound)),
                }
            }
            Err(e) => failed(e.into_reason(FailureReason::CreationRejected, FailureReason::ContainerNotFound)),
        }
    }

    /// Send `content` into a handle. No internal retry.
    pub async fn post_message(&self, handle_id: &str, content: &str) -> CallOutcome {
        let Some(platform) = self.ready_platform().await else {
            return CallOutcome::Failed {
                reason: FailureReason::BackendDisabled,
            };
        };
        match self
            .call("send_message", platform.send_message(handle_id, content))
            .await
        {
            Ok(()) => CallOutcome::Ok,
            Err(e) => CallOutcome::Failed {
                reason: e.into_reason(FailureReason::SendRejected, FailureReason::HandleNotFound),
            },
        }
    }

    /// Best-effort archival; the caller decides how loudly to log a failure.
    pub async fn archive_handle(&self, handle_id: &str) -> CallOutcome {
        let Some(platform) = self.ready_platform().await else {
            return CallOutcome::Failed {
                reason: FailureReason::BackendDisabled,
            };
        };
        match self
            .call("archive_thread", platform.archive_thread(handle_id))
            .await
        {
            Ok(()) => CallOutcome::Ok,
            Err(e) => CallOutcome::Failed {
                reason: e.into_reason(FailureReason::SendRejected, FailureReason::HandleNotFound),
            },
        }
    }
}

/// Platform-facing handle name: `Chat - {visitor} - {session prefix}`.
pub fn handle_display_name(visitor_name: &str, session_id: &str) -> String {
    let collapsed = visitor_name.split_whitespace().collect::<Vec<_>>().join(" ");
    let base: String = collapsed.chars().take(MAX_VISITOR_NAME_LEN).collect();
    let base = base.trim();
    let base = if base.is_empty() { "Guest" } else { base };

    let suffix: String = session_id.chars().take(SESSION_SUFFIX_LEN).collect();
    let full = if suffix.is_empty() {
        format!("Chat - {}", base)
    } else {
        format!("Chat - {} - {}", base, suffix)
    };
    full.chars().take(MAX_HANDLE_NAME_LEN).collect()
}
