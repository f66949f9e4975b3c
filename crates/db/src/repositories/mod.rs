use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use returndesk_core::config::{SessionBackend, SessionConfig};
use returndesk_core::domain::conversation::{Message, ThreadId};

pub mod memory;
pub mod session;

pub use memory::InMemorySessionStore;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unknown table `{0}`")]
    UnknownTable(String),
}

/// Ordered per-thread message history.
///
/// Each `append` is atomic; callers that need a whole turn to be
/// uninterrupted serialize on the thread id themselves.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append(&self, thread_id: &ThreadId, message: Message) -> Result<(), RepositoryError>;

    /// Messages in append order. Unknown threads yield an empty history.
    async fn get_history(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RepositoryError>;

    /// Drops threads with no activity for at least `idle_for`; returns how many went.
    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, RepositoryError>;
}

/// The session backend selected by configuration.
pub fn session_store_for(
    config: &SessionConfig,
    pool: &crate::DbPool,
) -> Arc<dyn SessionStore> {
    match config.backend {
        SessionBackend::Memory => {
            Arc::new(InMemorySessionStore::with_max_threads(config.max_threads))
        }
        SessionBackend::Sqlite => Arc::new(SqlSessionStore::new(pool.clone())),
    }
}
