use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use returndesk_core::domain::conversation::{Message, MessageRole, ThreadId};

use super::{RepositoryError, SessionStore};
use crate::DbPool;

/// Session store backed by the `conversation_message` table.
pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn append(&self, thread_id: &ThreadId, message: Message) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_message (thread_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(thread_id.as_str())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(encode_timestamp(&message.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_history(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT role, content, created_at
             FROM conversation_message
             WHERE thread_id = ?
             ORDER BY id ASC",
        )
        .bind(thread_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let role: String = row.try_get("role")?;
                let role = role.parse::<MessageRole>().map_err(RepositoryError::Decode)?;
                let created_at: String = row.try_get("created_at")?;
                let timestamp = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|error| RepositoryError::Decode(error.to_string()))?
                    .with_timezone(&Utc);
                Ok(Message { role, content: row.try_get("content")?, timestamp })
            })
            .collect()
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, RepositoryError> {
        let idle_for = chrono::Duration::from_std(idle_for)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let cutoff = encode_timestamp(&(Utc::now() - idle_for));

        let mut tx = self.pool.begin().await?;
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT thread_id FROM conversation_message
             GROUP BY thread_id
             HAVING MAX(created_at) <= ?",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        for thread_id in &stale {
            sqlx::query("DELETE FROM conversation_message WHERE thread_id = ?")
                .bind(thread_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use returndesk_core::domain::conversation::{Message, MessageRole, ThreadId};

    use super::SqlSessionStore;
    use crate::migrations::run_pending;
    use crate::repositories::SessionStore;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn sql_history_is_ordered_by_append() {
        let store = SqlSessionStore::new(setup_pool().await);
        let thread = ThreadId("sql-thread".to_string());

        store.append(&thread, Message::user("where is my order?")).await.expect("append");
        store.append(&thread, Message::assistant("It shipped yesterday.")).await.expect("append");
        store.append(&thread, Message::tool("status lookup ok")).await.expect("append");

        let history = store.get_history(&thread).await.expect("history");
        let roles: Vec<_> = history.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant, MessageRole::Tool]);
        assert_eq!(history[1].content, "It shipped yesterday.");
    }

    #[tokio::test]
    async fn sql_timestamps_survive_storage() {
        let store = SqlSessionStore::new(setup_pool().await);
        let thread = ThreadId("ts".to_string());
        let message = Message::user("hello");

        store.append(&thread, message.clone()).await.expect("append");
        let history = store.get_history(&thread).await.expect("history");

        assert_eq!(history[0].timestamp.timestamp_micros(), message.timestamp.timestamp_micros());
    }

    #[tokio::test]
    async fn sql_evict_idle_removes_whole_threads() {
        let store = SqlSessionStore::new(setup_pool().await);
        let thread = ThreadId("old".to_string());
        store.append(&thread, Message::user("one")).await.expect("append");
        store.append(&thread, Message::assistant("two")).await.expect("append");

        assert_eq!(store.evict_idle(Duration::from_secs(3600)).await.expect("evict"), 0);
        assert_eq!(store.evict_idle(Duration::ZERO).await.expect("evict"), 1);
        assert!(store.get_history(&thread).await.expect("history").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sql_concurrent_appends_lose_nothing() {
        let store = Arc::new(SqlSessionStore::new(setup_pool().await));
        let thread = ThreadId("shared".to_string());

        let mut handles = Vec::new();
        for writer in 0..2 {
            let store = Arc::clone(&store);
            let thread = thread.clone();
            handles.push(tokio::spawn(async move {
                for index in 0..20 {
                    store
                        .append(&thread, Message::user(format!("w{writer}-{index}")))
                        .await
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join writer");
        }

        assert_eq!(store.get_history(&thread).await.expect("history").len(), 40);
    }
}
