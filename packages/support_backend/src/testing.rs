//! In-memory [`SupportPlatform`] for tests.
//!
//! Behaves like a tiny guild: text channels can be registered, threads
//! created under them get sequential ids, and every call is recorded so
//! tests can assert on what reached the platform.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::PlatformError;
use crate::platform::{ChannelInfo, ChannelKind, HandleKind, SupportPlatform};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedThread {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub kind: HandleKind,
}

#[derive(Default)]
struct FakeState {
    channels: HashMap<String, ChannelInfo>,
    fail_auth: bool,
    reject_private: bool,
    reject_all_creates: bool,
    fail_sends: bool,
    create_delay: Option<Duration>,
    next_thread: u64,
    created: Vec<CreatedThread>,
    sent: Vec<(String, String)>,
    archived: Vec<String>,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
    create_calls: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text_channel(self, id: &str) -> Self {
        self.add_text_channel(id);
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_text_channel(&self, id: &str) {
        self.add_channel(ChannelInfo {
            id: id.to_string(),
            kind: ChannelKind::Text,
            parent_id: None,
        });
    }

    pub fn add_channel(&self, info: ChannelInfo) {
        self.lock().channels.insert(info.id.clone(), info);
    }

    pub fn remove_channel(&self, id: &str) {
        self.lock().channels.remove(id);
    }

    pub fn fail_authentication(&self) {
        self.lock().fail_auth = true;
    }

    pub fn allow_authentication(&self) {
        self.lock().fail_auth = false;
    }

    pub fn reject_private_threads(&self) {
        self.lock().reject_private = true;
    }

    pub fn reject_thread_creation(&self) {
        self.lock().reject_all_creates = true;
    }

    pub fn fail_sends(&self) {
        self.lock().fail_sends = true;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = Some(delay);
    }

    /// Number of `create_thread` calls, including rejected ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<CreatedThread> {
        self.lock().created.clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, channel_id: &str) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .filter(|(c, _)| c == channel_id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn archived(&self) -> Vec<String> {
        self.lock().archived.clone()
    }
}

#[async_trait]
impl SupportPlatform for FakePlatform {
    async fn authenticate(&self) -> Result<String, PlatformError> {
        if self.lock().fail_auth {
            return Err(PlatformError::Unauthorized);
        }
        Ok("fake-bot#0001".to_string())
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, PlatformError> {
        Ok(self.lock().channels.get(channel_id).cloned())
    }

    async fn create_thread(
        &self,
        parent_id: &str,
        name: &str,
        kind: HandleKind,
    ) -> Result<String, PlatformError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.reject_all_creates || (kind == HandleKind::Private && state.reject_private) {
            return Err(PlatformError::Rejected {
                status: 403,
                message: "Missing Permissions".to_string(),
            });
        }
        if !state.channels.contains_key(parent_id) {
            return Err(PlatformError::NotFound);
        }

        state.next_thread += 1;
        let id = format!("thread-{}", state.next_thread);
        let thread_kind = match kind {
            HandleKind::Public => ChannelKind::PublicThread,
            HandleKind::Private => ChannelKind::PrivateThread,
        };
        state.channels.insert(
            id.clone(),
            ChannelInfo {
                id: id.clone(),
                kind: thread_kind,
                parent_id: Some(parent_id.to_string()),
            },
        );
        state.created.push(CreatedThread {
            id: id.clone(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind,
        });
        Ok(id)
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if state.fail_sends {
            return Err(PlatformError::Rejected {
                status: 403,
                message: "Missing Access".to_string(),
            });
        }
        if !state.channels.contains_key(channel_id) {
            return Err(PlatformError::NotFound);
        }
        state
            .sent
            .push((channel_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if !state.channels.contains_key(thread_id) {
            return Err(PlatformError::NotFound);
        }
        state.archived.push(thread_id.to_string());
        Ok(())
    }
}
