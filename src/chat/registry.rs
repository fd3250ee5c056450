//! Session registry with sliding expiration
//!
//! Each session owns its buffer behind its own async mutex, so requests for
//! one session serialize while unrelated sessions proceed independently. An
//! entry that is neither read nor written for the idle window is dropped
//! together with its history.

use super::buffer::ConversationBuffer;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One live conversation
#[derive(Debug)]
pub struct Session {
    id: i64,
    buffer: Mutex<ConversationBuffer>,
}

impl Session {
    fn new(id: i64, buffer: ConversationBuffer) -> Self {
        Self {
            id,
            buffer: Mutex::new(buffer),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Wait for exclusive access to the session history
    pub async fn lock(&self) -> MutexGuard<'_, ConversationBuffer> {
        self.buffer.lock().await
    }
}

/// Concurrent map from session id to its conversation
pub struct SessionRegistry {
    sessions: Cache<i64, Arc<Session>>,
    max_cost: usize,
}

impl SessionRegistry {
    /// Create a registry whose entries expire after `idle` without access
    pub fn new(max_cost: usize, idle: Duration) -> Self {
        let sessions = Cache::builder().time_to_idle(idle).build();
        Self { sessions, max_cost }
    }

    pub async fn has(&self, id: i64) -> bool {
        self.sessions.get(&id).await.is_some()
    }

    /// Store a fresh buffer for `id`, replacing any existing one
    pub async fn create(&self, id: i64, system_prompt: &str, max_count: usize) -> Arc<Session> {
        let buffer = ConversationBuffer::new(system_prompt, self.max_cost, max_count);
        let session = Arc::new(Session::new(id, buffer));
        self.sessions.insert(id, session.clone()).await;
        debug!(session_id = id, max_count, "session buffer created");
        session
    }

    pub async fn get(&self, id: i64) -> Option<Arc<Session>> {
        self.sessions.get(&id).await
    }

    pub async fn remove(&self, id: i64) {
        self.sessions.invalidate(&id).await;
    }

    /// All live sessions, without extending their expiry
    pub fn snapshot_all(&self) -> Vec<(i64, Arc<Session>)> {
        self.sessions
            .iter()
            .map(|(id, session)| (*id, session))
            .collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_cost(&self) -> usize {
        self.max_cost
    }
}
