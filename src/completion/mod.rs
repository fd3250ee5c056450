//! Remote text-completion capability
//!
//! The orchestrator only needs to submit role-tagged messages plus
//! generation options and get back either choices with a stop reason or a
//! failure whose text can be classified.

pub mod openai;

use crate::chat::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::OpenAiClient;

/// Stop reason reported when generation hit the output limit
pub const STOP_REASON_LENGTH: &str = "length";

/// Sampling options sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub max_tokens: usize,
    pub stop: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            repetition_penalty: None,
            max_tokens: 512,
            stop: Vec::new(),
        }
    }
}

/// One generated alternative
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub text: String,
    pub stop_reason: Option<String>,
}

impl Choice {
    /// False when generation was cut off by the output limit
    pub fn at_end(&self) -> bool {
        self.stop_reason.as_deref() != Some(STOP_REASON_LENGTH)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub choices: Vec<Choice>,
}

/// Completion call failures
///
/// The display text carries the upstream status and body verbatim; retry
/// classification works on that text.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Status {status}: {body}")]
    Upstream { status: String, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A model endpoint able to complete a conversation
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier used for logs
    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<CompletionResponse, CompletionError>;
}
