use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use returndesk_core::domain::conversation::{Message, ThreadId};

use super::{RepositoryError, SessionStore};

struct ThreadEntry {
    messages: Vec<Message>,
    last_active: Instant,
}

/// Threads active this recently may be mid-turn and are never evicted for capacity.
pub const DEFAULT_BUSY_GRACE: Duration = Duration::from_secs(300);

/// Process-local thread histories, bounded by `max_threads`.
///
/// When a new thread arrives at capacity, the least recently active thread idle
/// for at least `busy_grace` is dropped. If every thread is inside the grace
/// period the store grows past `max_threads` until some go quiet.
pub struct InMemorySessionStore {
    threads: RwLock<HashMap<String, ThreadEntry>>,
    max_threads: usize,
    busy_grace: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_max_threads(usize::MAX)
    }
}

impl InMemorySessionStore {
    pub fn with_max_threads(max_threads: usize) -> Self {
        Self::with_limits(max_threads, DEFAULT_BUSY_GRACE)
    }

    pub fn with_limits(max_threads: usize, busy_grace: Duration) -> Self {
        Self { threads: RwLock::new(HashMap::new()), max_threads: max_threads.max(1), busy_grace }
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }
}

fn least_recently_active(
    threads: &HashMap<String, ThreadEntry>,
    busy_grace: Duration,
) -> Option<String> {
    threads
        .iter()
        .filter(|(_, entry)| entry.last_active.elapsed() >= busy_grace)
        .min_by_key(|(_, entry)| entry.last_active)
        .map(|(key, _)| key.clone())
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(&self, thread_id: &ThreadId, message: Message) -> Result<(), RepositoryError> {
        let mut threads = self.threads.write().await;

        if !threads.contains_key(thread_id.as_str()) && threads.len() >= self.max_threads {
            if let Some(oldest) = least_recently_active(&threads, self.busy_grace) {
                threads.remove(&oldest);
            }
        }

        let entry = threads
            .entry(thread_id.0.clone())
            .or_insert_with(|| ThreadEntry { messages: Vec::new(), last_active: Instant::now() });
        entry.messages.push(message);
        entry.last_active = Instant::now();
        Ok(())
    }

    async fn get_history(&self, thread_id: &ThreadId) -> Result<Vec<Message>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id.as_str()).map(|entry| entry.messages.clone()).unwrap_or_default())
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize, RepositoryError> {
        let mut threads = self.threads.write().await;
        let before = threads.len();
        threads.retain(|_, entry| entry.last_active.elapsed() < idle_for);
        Ok(before - threads.len())
    }
}
