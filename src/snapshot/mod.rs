//! Session snapshots for restart survival
//!
//! Sessions are not persisted incrementally: the whole registry is dumped at
//! shutdown and restored at startup, so turns made after the last dump are
//! lost on a crash.

pub mod file;

use crate::chat::Role;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use file::JsonFileStore;

/// One stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    pub session_id: i64,
    pub role: Role,
    pub text: String,
}

/// All live sessions at one point in time
///
/// `messages` is grouped by session, each group starting with its system
/// prompt and keeping conversation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub saved_at: DateTime<Utc>,
    pub messages: Vec<DialogMessage>,
    #[serde(default)]
    pub max_history: HashMap<i64, usize>,
}

impl SessionSnapshot {
    pub fn new(messages: Vec<DialogMessage>, max_history: HashMap<i64, usize>) -> Self {
        Self {
            saved_at: Utc::now(),
            messages,
            max_history,
        }
    }

    /// Number of distinct sessions
    pub fn session_count(&self) -> usize {
        let mut count = 0;
        let mut current = None;
        for message in &self.messages {
            if current != Some(message.session_id) {
                current = Some(message.session_id);
                count += 1;
            }
        }
        count
    }
}

/// Durable storage for session snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last snapshot, `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<SessionSnapshot>>;

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
}
