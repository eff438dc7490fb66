use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// Visibility of a conversation handle created under a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    #[default]
    Public,
    Private,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Public => "public",
            HandleKind::Private => "private",
        }
    }

    /// Lenient parse: anything other than `private` is public.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("private") {
            HandleKind::Private
        } else {
            HandleKind::Public
        }
    }
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a platform channel id refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// A container handles can be created under
    Text,
    /// Already a conversation handle
    PublicThread,
    PrivateThread,
    /// Voice, category, forum, DM, ...
    Other,
}

impl ChannelKind {
    pub fn is_handle(&self) -> bool {
        matches!(self, ChannelKind::PublicThread | ChannelKind::PrivateThread)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub kind: ChannelKind,
    pub parent_id: Option<String>,
}

/// A message observed on the platform, before session resolution.
#[derive(Clone, Debug)]
pub struct InboundPlatformMessage {
    pub channel_id: String,
    pub author: String,
    pub author_is_bot: bool,
    pub in_guild: bool,
    pub content: String,
}

/// The capability the bridge drives. Implementations speak the platform's
/// wire protocol; the bridge owns timeouts, allow-lists and fallbacks.
#[async_trait]
pub trait SupportPlatform: Send + Sync {
    /// Validate credentials. Returns the bot's display tag.
    async fn authenticate(&self) -> Result<String, PlatformError>;

    /// Look up a channel. `Ok(None)` when it does not exist.
    async fn fetch_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, PlatformError>;

    /// Create a conversation handle under `parent_id`. Returns the new handle id.
    async fn create_thread(
        &self,
        parent_id: &str,
        name: &str,
        kind: HandleKind,
    ) -> Result<String, PlatformError>;

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PlatformError>;

    async fn archive_thread(&self, thread_id: &str) -> Result<(), PlatformError>;
}
