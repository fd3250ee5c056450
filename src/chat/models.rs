//! Message types held by conversation buffers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cap applied to the system prompt when accounting its cost
pub const SYSTEM_MESSAGE_CAP: usize = 4000;

/// Cap applied to user messages when accounting their cost
pub const USER_MESSAGE_CAP: usize = 4000;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation turn
///
/// `cost` is the accounted length: the byte length of the text capped per
/// role. It is a cheap stand-in for the token count, not a tokenizer result,
/// and eviction timing depends on it staying that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub cost: usize,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, cap: usize) -> Self {
        let text = text.into();
        let cost = accounted_length(&text, cap);
        Self { role, text, cost }
    }
}

/// Length of `text` in bytes, capped at `cap`
pub fn accounted_length(text: &str, cap: usize) -> usize {
    text.len().min(cap)
}
