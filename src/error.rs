//! Error types shared across the crate

use crate::completion::CompletionError;
use thiserror::Error;

/// Result alias used by the orchestrator, registry and stores
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors surfaced to callers of the chat orchestrator
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Session {0} is not started")]
    SessionNotFound(i64),

    #[error("Completion failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Malformed wait hint: {0}")]
    MalformedWaitHint(String),

    #[error("Model returned an empty completion")]
    EmptyCompletion,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ChatError {
    fn from(err: config::ConfigError) -> Self {
        ChatError::Config(err.to_string())
    }
}

impl ChatError {
    /// Label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::SessionNotFound(_) => "session_not_found",
            ChatError::RetriesExhausted { .. } => "retries_exhausted",
            ChatError::Completion(_) => "completion",
            ChatError::MalformedWaitHint(_) => "malformed_wait_hint",
            ChatError::EmptyCompletion => "empty_completion",
            ChatError::Config(_) => "config",
            ChatError::Snapshot(_) => "snapshot",
            ChatError::Io(_) => "io",
            ChatError::Serialization(_) => "serialization",
        }
    }
}
