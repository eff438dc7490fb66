use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::{PageView, now_millis};

use super::{MAX_PAGE_VIEW_LIST, SessionRepository};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

fn page_view_from_row(r: &SqliteRow) -> PageView {
    PageView {
        id: Some(r.get("id")),
        session_id: r.get("session_id"),
        visitor_id: r.get("visitor_id"),
        url: r.get("url"),
        title: r.get("title"),
        referrer: r.get("referrer"),
        ip: r.get("ip"),
        user_agent: r.get("user_agent"),
        created_at: r.get("created_at"),
    }
}

impl SessionRepository {
    pub async fn insert_page_view(&self, view: &PageView) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO page_views (session_id, visitor_id, url, title, referrer, ip, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&view.session_id)
        .bind(&view.visitor_id)
        .bind(&view.url)
        .bind(&view.title)
        .bind(&view.referrer)
        .bind(&view.ip)
        .bind(&view.user_agent)
        .bind(view.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert page view")?;

        Ok(result.last_insert_rowid())
    }

    /// Newest first. `since` is a lower bound on `created_at`.
    pub async fn page_views_for_session(
        &self,
        session_id: &str,
        since: Option<i64>,
        limit: i64,
    ) -> Result<Vec<PageView>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, visitor_id, url, title, referrer, ip, user_agent, created_at
            FROM page_views
            WHERE session_id = ? AND (? IS NULL OR created_at >= ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(since)
        .bind(since)
        .bind(limit.clamp(1, MAX_PAGE_VIEW_LIST))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load page views")?;

        Ok(rows.iter().map(page_view_from_row).collect())
    }

    pub async fn recent_page_views(&self, limit: i64) -> Result<Vec<PageView>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, visitor_id, url, title, referrer, ip, user_agent, created_at
            FROM page_views
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, MAX_PAGE_VIEW_LIST))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load page views")?;

        Ok(rows.iter().map(page_view_from_row).collect())
    }

    /// Delete page views older than `days`. Returns the number of rows removed.
    pub async fn cleanup_old_page_views(&self, days: u32) -> Result<u64> {
        let cutoff = now_millis() - i64::from(days) * MILLIS_PER_DAY;
        let result = sqlx::query("DELETE FROM page_views WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to clean up page views")?;

        Ok(result.rows_affected())
    }
}
