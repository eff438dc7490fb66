//! Support Backend - bridge between the web chat gateway and a support platform
//!
//! This crate isolates everything that depends on the support platform's
//! availability. Callers never see a platform error directly: every operation
//! on [`BackendBridge`] returns a tagged outcome, and a failed login leaves the
//! bridge `Disabled` instead of bringing the process down.
//!
//! The platform itself sits behind the [`SupportPlatform`] trait. [`discord`]
//! provides the production implementation (REST for calls, gateway websocket
//! for inbound agent replies).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use support_backend::{BackendBridge, BridgeConfig, EnsureHandleRequest, HandleKind};
//! use support_backend::discord::DiscordPlatform;
//!
//! #[tokio::main]
//! async fn main() {
//!     let platform = DiscordPlatform::new("bot-token", "https://discord.com/api/v10");
//!     let bridge = BackendBridge::new(Some(Arc::new(platform)), BridgeConfig::default());
//!     bridge.start().await;
//!
//!     let outcome = bridge
//!         .ensure_handle(&EnsureHandleRequest {
//!             session_id: "abc123".into(),
//!             channel_id: "1234567890".into(),
//!             kind: HandleKind::Public,
//!             display_name: "Guest".into(),
//!         })
//!         .await;
//!     println!("{:?}", outcome);
//! }
//! ```

mod bridge;
pub mod discord;
mod error;
mod listener;
mod platform;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bridge::{
    BackendBridge, BridgeConfig, BridgeState, CallOutcome, EnsureHandleOutcome,
    EnsureHandleRequest, FailureReason, MAX_HANDLE_NAME_LEN, handle_display_name,
};
pub use error::PlatformError;
pub use listener::{HandleResolver, InboundAgentMessage, run_inbound_listener, spawn_inbound_listener};
pub use platform::{ChannelInfo, ChannelKind, HandleKind, InboundPlatformMessage, SupportPlatform};
