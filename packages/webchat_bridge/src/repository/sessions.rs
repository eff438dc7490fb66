use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use support_backend::HandleKind;

use crate::models::{
    IdentityPatch, Session, SessionMode, SessionSummary, TrackingUpdate, now_millis,
};

use super::{MAX_SESSION_LIST, SessionRepository};

const SESSION_COLUMNS: &str = r#"
    session_id, mode, visitor_name, visitor_email, client_id, visitor_id,
    entry_url, referrer, backend_channel_id, backend_handle_id, handle_kind,
    last_page_url, last_seen_at, geo_country, geo_region, geo_city,
    closed, created_at, updated_at
"#;

fn session_from_row(r: &SqliteRow) -> Session {
    Session {
        session_id: r.get("session_id"),
        mode: SessionMode::parse(r.get::<&str, _>("mode")),
        visitor_name: r.get("visitor_name"),
        visitor_email: r.get("visitor_email"),
        client_id: r.get("client_id"),
        visitor_id: r.get("visitor_id"),
        entry_url: r.get("entry_url"),
        referrer: r.get("referrer"),
        backend_channel_id: r.get("backend_channel_id"),
        backend_handle_id: r.get("backend_handle_id"),
        handle_kind: r
            .get::<Option<String>, _>("handle_kind")
            .map(|k| HandleKind::parse(&k)),
        last_page_url: r.get("last_page_url"),
        last_seen_at: r.get("last_seen_at"),
        geo_country: r.get("geo_country"),
        geo_region: r.get("geo_region"),
        geo_city: r.get("geo_city"),
        closed: r.get("closed"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

impl SessionRepository {
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {} FROM sessions WHERE session_id = ?", SESSION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session")?;

        Ok(row.as_ref().map(session_from_row))
    }

    /// Insert or merge a session row.
    ///
    /// First-touch context and backend routing fields keep their stored value
    /// once set; identity and telemetry take the new value unless it is NULL;
    /// `closed` never reverts.
    pub async fn upsert_session(&self, s: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, mode, visitor_name, visitor_email, client_id, visitor_id,
                entry_url, referrer, backend_channel_id, backend_handle_id, handle_kind,
                last_page_url, last_seen_at, geo_country, geo_region, geo_city,
                closed, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                mode = excluded.mode,
                visitor_name = COALESCE(excluded.visitor_name, sessions.visitor_name),
                visitor_email = COALESCE(excluded.visitor_email, sessions.visitor_email),
                client_id = COALESCE(excluded.client_id, sessions.client_id),
                visitor_id = COALESCE(sessions.visitor_id, excluded.visitor_id),
                entry_url = COALESCE(sessions.entry_url, excluded.entry_url),
                referrer = COALESCE(sessions.referrer, excluded.referrer),
                backend_channel_id = COALESCE(sessions.backend_channel_id, excluded.backend_channel_id),
                handle_kind = CASE
                    WHEN sessions.backend_handle_id IS NULL THEN COALESCE(excluded.handle_kind, sessions.handle_kind)
                    ELSE sessions.handle_kind
                END,
                backend_handle_id = COALESCE(sessions.backend_handle_id, excluded.backend_handle_id),
                last_page_url = COALESCE(excluded.last_page_url, sessions.last_page_url),
                last_seen_at = COALESCE(excluded.last_seen_at, sessions.last_seen_at),
                geo_country = COALESCE(excluded.geo_country, sessions.geo_country),
                geo_region = COALESCE(excluded.geo_region, sessions.geo_region),
                geo_city = COALESCE(excluded.geo_city, sessions.geo_city),
                closed = MAX(sessions.closed, excluded.closed),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&s.session_id)
        .bind(s.mode.as_str())
        .bind(&s.visitor_name)
        .bind(&s.visitor_email)
        .bind(&s.client_id)
        .bind(&s.visitor_id)
        .bind(&s.entry_url)
        .bind(&s.referrer)
        .bind(&s.backend_channel_id)
        .bind(&s.backend_handle_id)
        .bind(s.handle_kind.map(|k| k.as_str()))
        .bind(&s.last_page_url)
        .bind(s.last_seen_at)
        .bind(&s.geo_country)
        .bind(&s.geo_region)
        .bind(&s.geo_city)
        .bind(s.closed)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert session")?;

        Ok(())
    }

    /// Set the routing container if none is stored. Returns whether this call set it.
    pub async fn bind_channel(&self, session_id: &str, channel_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET backend_channel_id = ?, updated_at = ? WHERE session_id = ? AND backend_channel_id IS NULL",
        )
        .bind(channel_id)
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to bind channel")?;

        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set the conversation handle. Returns `false` when a handle
    /// was already bound (the stored one wins).
    pub async fn bind_handle(
        &self,
        session_id: &str,
        handle_id: &str,
        channel_id: &str,
        kind: HandleKind,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET backend_handle_id = ?,
                backend_channel_id = COALESCE(backend_channel_id, ?),
                handle_kind = ?,
                updated_at = ?
            WHERE session_id = ? AND backend_handle_id IS NULL
            "#,
        )
        .bind(handle_id)
        .bind(channel_id)
        .bind(kind.as_str())
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to bind handle")?;

        Ok(result.rows_affected() > 0)
    }

    /// Fill identity/context columns that are still empty. Known values are never replaced.
    pub async fn fill_identity(&self, session_id: &str, patch: &IdentityPatch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                visitor_name = COALESCE(visitor_name, ?),
                visitor_email = COALESCE(visitor_email, ?),
                visitor_id = COALESCE(visitor_id, ?),
                entry_url = COALESCE(entry_url, ?),
                referrer = COALESCE(referrer, ?),
                updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(&patch.visitor_name)
        .bind(&patch.visitor_email)
        .bind(&patch.visitor_id)
        .bind(&patch.entry_url)
        .bind(&patch.referrer)
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to fill identity")?;

        Ok(())
    }

    /// Record identity hints; a provided value replaces the stored one, `None` keeps it.
    pub async fn record_identity(
        &self,
        session_id: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                visitor_name = COALESCE(?, visitor_name),
                visitor_email = COALESCE(?, visitor_email),
                updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(name)
        .bind(email)
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to record identity")?;

        Ok(())
    }

    pub async fn update_tracking(&self, session_id: &str, update: &TrackingUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                last_page_url = COALESCE(?, last_page_url),
                last_seen_at = MAX(COALESCE(last_seen_at, 0), ?),
                visitor_id = COALESCE(visitor_id, ?),
                geo_country = COALESCE(?, geo_country),
                geo_region = COALESCE(?, geo_region),
                geo_city = COALESCE(?, geo_city),
                updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(&update.last_page_url)
        .bind(update.last_seen_at)
        .bind(&update.visitor_id)
        .bind(&update.geo_country)
        .bind(&update.geo_region)
        .bind(&update.geo_city)
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to update tracking")?;

        Ok(())
    }

    /// Returns `true` only for the call that performed the open → closed transition.
    pub async fn mark_closed(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET closed = 1, updated_at = ? WHERE session_id = ? AND closed = 0",
        )
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to close session")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_session_by_handle(&self, handle_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar("SELECT session_id FROM sessions WHERE backend_handle_id = ?")
            .bind(handle_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to resolve handle")?;

        Ok(id)
    }

    /// Admin listing, newest first. `since` is a lower bound on `created_at`.
    pub async fn list_sessions(&self, since: Option<i64>, limit: i64) -> Result<Vec<SessionSummary>> {
        let limit = limit.clamp(1, MAX_SESSION_LIST);
        let sql = format!(
            r#"
            SELECT {},
                (SELECT COUNT(*) FROM messages m WHERE m.session_id = sessions.session_id) AS message_count,
                (SELECT MAX(created_at) FROM messages m WHERE m.session_id = sessions.session_id) AS last_message_at
            FROM sessions
            WHERE ? IS NULL OR created_at >= ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sessions")?;

        Ok(rows
            .iter()
            .map(|r| {
                let session = session_from_row(r);
                SessionSummary {
                    routing_state: session.routing_state(),
                    session,
                    message_count: r.get("message_count"),
                    last_message_at: r.get("last_message_at"),
                }
            })
            .collect())
    }
}
