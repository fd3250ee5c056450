//! Bounded conversation buffer with two-tier eviction
//!
//! A buffer always starts with the system prompt, followed by user/assistant
//! turns. Appending a message may trigger eviction of the oldest turns when
//! either the accounted cost reaches `max_cost` or the number of turns
//! exceeds `max_count` (0 disables either limit). Eviction always removes an
//! even number of turns so the history keeps starting on a user message.

use super::models::{Message, Role, SYSTEM_MESSAGE_CAP, USER_MESSAGE_CAP};
use crate::metrics::METRICS;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Conversation history for one session
#[derive(Debug, Clone)]
pub struct ConversationBuffer {
    messages: Vec<Message>,
    cur_cost: usize,
    max_cost: usize,
    max_count: usize,
    last_mutation: Instant,
    evictions: u64,
}

/// Saved buffer state used to undo a failed turn
#[derive(Debug, Clone)]
pub struct Checkpoint {
    messages: Vec<Message>,
    cur_cost: usize,
    last_mutation: Instant,
    evictions: u64,
}

impl ConversationBuffer {
    /// Create a buffer holding only the system prompt
    pub fn new(system_prompt: impl Into<String>, max_cost: usize, max_count: usize) -> Self {
        let system = Message::new(Role::System, system_prompt, SYSTEM_MESSAGE_CAP);
        let cur_cost = system.cost;

        Self {
            messages: vec![system],
            cur_cost,
            max_cost,
            max_count,
            last_mutation: Instant::now(),
            evictions: 0,
        }
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.append(Message::new(Role::User, text, USER_MESSAGE_CAP));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>, cap: usize) {
        self.append(Message::new(Role::Assistant, text, cap));
    }

    fn append(&mut self, message: Message) {
        self.cur_cost += message.cost;
        self.messages.push(message);
        self.last_mutation = Instant::now();

        if self.over_cost() || self.over_count(0) {
            self.clean_history();
        }
    }

    /// Undo the most recent append. The system prompt is never removed.
    pub fn remove_last(&mut self) {
        if self.messages.len() <= 1 {
            return;
        }
        if let Some(message) = self.messages.pop() {
            self.cur_cost -= message.cost;
        }
    }

    fn over_cost(&self) -> bool {
        self.max_cost > 0 && self.cur_cost >= self.max_cost
    }

    fn over_count(&self, removed: usize) -> bool {
        self.max_count > 0 && self.turn_count() - removed > self.max_count
    }

    /// Evict the oldest turns until both limits hold again
    ///
    /// Removal stops on an even, non-zero count whenever enough turns exist,
    /// so an explicit call always drops at least one user/assistant pair.
    pub fn clean_history(&mut self) {
        let total = self.turn_count();
        if total == 0 {
            return;
        }

        let mut removed = 0;
        while removed < total && (self.over_cost() || self.over_count(removed)) {
            removed += 1;
            self.cur_cost -= self.messages[removed].cost;
        }
        while (removed == 0 || removed % 2 != 0) && removed < total {
            removed += 1;
            self.cur_cost -= self.messages[removed].cost;
        }

        self.messages.drain(1..=removed);
        self.evictions += 1;
        METRICS.history_evictions.inc();

        info!(
            removed,
            left = self.messages.len(),
            cost = self.cur_cost,
            "clean history"
        );
    }

    /// True when the last mutation is older than `max_idle`
    pub fn is_expired(&self, max_idle: Duration) -> bool {
        self.last_mutation.elapsed() > max_idle
    }

    /// Drop every turn, keeping the system prompt
    pub fn restart(&mut self) {
        self.messages.truncate(1);
        self.cur_cost = self.messages[0].cost;
        debug!(cost = self.cur_cost, "history restarted");
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            messages: self.messages.clone(),
            cur_cost: self.cur_cost,
            last_mutation: self.last_mutation,
            evictions: self.evictions,
        }
    }

    /// Return to the state captured by `checkpoint`
    ///
    /// When nothing was evicted since the checkpoint and exactly one message
    /// was appended, this is a plain `remove_last`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        if self.evictions == checkpoint.evictions
            && self.messages.len() == checkpoint.messages.len() + 1
        {
            self.remove_last();
        } else {
            self.messages = checkpoint.messages;
            self.cur_cost = checkpoint.cur_cost;
            self.evictions = checkpoint.evictions;
        }
        self.last_mutation = checkpoint.last_mutation;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].text
    }

    /// Number of messages including the system prompt
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: the system prompt is never evicted
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of user/assistant messages
    pub fn turn_count(&self) -> usize {
        self.messages.len() - 1
    }

    pub fn cur_cost(&self) -> usize {
        self.cur_cost
    }

    pub fn max_cost(&self) -> usize {
        self.max_cost
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn last_message_cost(&self) -> usize {
        self.messages.last().map(|m| m.cost).unwrap_or(0)
    }

    /// Number of eviction passes run so far
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
