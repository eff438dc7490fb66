//! The persistence seam the relay talks to.
//!
//! [`SessionRepository`] is the production implementation; tests wrap it to
//! inject failures.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use support_backend::{HandleKind, HandleResolver};

use crate::models::{IdentityPatch, Message, PageView, Session, TrackingUpdate};
use crate::repository::SessionRepository;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;
    async fn upsert(&self, session: &Session) -> Result<()>;
    async fn bind_channel(&self, session_id: &str, channel_id: &str) -> Result<bool>;
    async fn bind_handle(
        &self,
        session_id: &str,
        handle_id: &str,
        channel_id: &str,
        kind: HandleKind,
    ) -> Result<bool>;
    async fn fill_identity(&self, session_id: &str, patch: &IdentityPatch) -> Result<()>;
    async fn record_identity(
        &self,
        session_id: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<()>;
    async fn update_tracking(&self, session_id: &str, update: &TrackingUpdate) -> Result<()>;
    async fn mark_closed(&self, session_id: &str) -> Result<bool>;
    async fn append_message(&self, message: &Message) -> Result<i64>;
    async fn transcript(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn find_session_by_handle(&self, handle_id: &str) -> Result<Option<String>>;
    async fn record_page_view(&self, view: &PageView) -> Result<i64>;
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.get_session(session_id).await
    }

    async fn upsert(&self, session: &Session) -> Result<()> {
        self.upsert_session(session).await
    }

    async fn bind_channel(&self, session_id: &str, channel_id: &str) -> Result<bool> {
        SessionRepository::bind_channel(self, session_id, channel_id).await
    }

    async fn bind_handle(
        &self,
        session_id: &str,
        handle_id: &str,
        channel_id: &str,
        kind: HandleKind,
    ) -> Result<bool> {
        SessionRepository::bind_handle(self, session_id, handle_id, channel_id, kind).await
    }

    async fn fill_identity(&self, session_id: &str, patch: &IdentityPatch) -> Result<()> {
        SessionRepository::fill_identity(self, session_id, patch).await
    }

    async fn record_identity(
        &self,
        session_id: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        SessionRepository::record_identity(self, session_id, name, email).await
    }

    async fn update_tracking(&self, session_id: &str, update: &TrackingUpdate) -> Result<()> {
        SessionRepository::update_tracking(self, session_id, update).await
    }

    async fn mark_closed(&self, session_id: &str) -> Result<bool> {
        SessionRepository::mark_closed(self, session_id).await
    }

    async fn append_message(&self, message: &Message) -> Result<i64> {
        SessionRepository::append_message(self, message).await
    }

    async fn transcript(&self, session_id: &str) -> Result<Vec<Message>> {
        SessionRepository::transcript(self, session_id).await
    }

    async fn find_session_by_handle(&self, handle_id: &str) -> Result<Option<String>> {
        SessionRepository::find_session_by_handle(self, handle_id).await
    }

    async fn record_page_view(&self, view: &PageView) -> Result<i64> {
        self.insert_page_view(view).await
    }
}

/// Lets the backend's inbound listener resolve handles through the store.
pub struct StoreHandleResolver(pub Arc<dyn SessionStore>);

#[async_trait]
impl HandleResolver for StoreHandleResolver {
    async fn session_for_handle(&self, handle_id: &str) -> Result<Option<String>> {
        self.0.find_session_by_handle(handle_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMode;
    use crate::repository::test_helpers::test_repository;

    #[tokio::test]
    async fn resolver_maps_bound_handles_only() {
        let repo = test_repository().await;
        repo.upsert_session(&Session::new("s1".into(), SessionMode::Guest))
            .await
            .unwrap();
        repo.bind_handle("s1", "t1", "c1", HandleKind::Public)
            .await
            .unwrap();

        let resolver = StoreHandleResolver(Arc::new(repo));
        assert_eq!(
            resolver.session_for_handle("t1").await.unwrap().as_deref(),
            Some("s1")
        );
        assert!(resolver.session_for_handle("t9").await.unwrap().is_none());
    }
}
