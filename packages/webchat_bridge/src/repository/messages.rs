use anyhow::{Context, Result};
use sqlx::Row;

use crate::models::{Direction, Message};

use super::SessionRepository;

impl SessionRepository {
    pub async fn append_message(&self, msg: &Message) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (session_id, direction, author, body, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.session_id)
        .bind(msg.direction.as_str())
        .bind(&msg.author)
        .bind(&msg.body)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(result.last_insert_rowid())
    }

    /// Full transcript, oldest first. Ties on `created_at` break on insertion order.
    pub async fn transcript(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, direction, author, body, created_at
            FROM messages
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load transcript")?;

        Ok(rows
            .into_iter()
            .map(|r| Message {
                id: Some(r.get("id")),
                session_id: r.get("session_id"),
                direction: Direction::parse(r.get::<&str, _>("direction"))
                    .unwrap_or(Direction::System),
                author: r.get("author"),
                body: r.get("body"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::test_repository;
    use super::*;
    use crate::models::{Session, SessionMode};

    #[tokio::test]
    async fn test_transcript_orders_by_time_then_sequence() {
        let repo = test_repository().await;
        repo.upsert_session(&Session::new("s1".into(), SessionMode::Guest))
            .await
            .unwrap();

        let mut late = Message::new("s1", Direction::Visitor, None, "late");
        late.created_at = 2_000;
        let mut tie_a = Message::new("s1", Direction::Visitor, None, "tie-a");
        tie_a.created_at = 1_000;
        let mut tie_b = Message::new("s1", Direction::Agent, Some("kim".into()), "tie-b");
        tie_b.created_at = 1_000;

        repo.append_message(&late).await.unwrap();
        let a = repo.append_message(&tie_a).await.unwrap();
        let b = repo.append_message(&tie_b).await.unwrap();
        assert!(b > a);

        let bodies: Vec<String> = repo
            .transcript("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn test_transcript_is_scoped_to_session() {
        let repo = test_repository().await;
        for id in ["s1", "s2"] {
            repo.upsert_session(&Session::new(id.into(), SessionMode::Guest))
                .await
                .unwrap();
        }
        repo.append_message(&Message::new("s1", Direction::Visitor, None, "mine"))
            .await
            .unwrap();
        repo.append_message(&Message::new("s2", Direction::Visitor, None, "theirs"))
            .await
            .unwrap();

        let transcript = repo.transcript("s1").await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].body, "mine");
        assert_eq!(transcript[0].direction, Direction::Visitor);
        assert!(transcript[0].id.is_some());
    }

    #[tokio::test]
    async fn test_append_for_unknown_session_fails() {
        let repo = test_repository().await;
        let result = repo
            .append_message(&Message::new("ghost", Direction::Visitor, None, "hi"))
            .await;
        assert!(result.is_err());
    }
}
