//! OpenAI-compatible chat completions client

use super::{Choice, CompletionClient, CompletionError, CompletionResponse, GenerationOptions};
use crate::chat::Message;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Client for any endpoint speaking the `/chat/completions` protocol
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
}

impl OpenAiClient {
    /// Create a new client for `model`
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a GenerationOptions,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.text,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_k: options.top_k,
            repetition_penalty: options.repetition_penalty,
            stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.build_request(messages, options);

        debug!(model = %self.model, messages = messages.len(), "calling completion API");

        let mut req = self.http.post(&url).json(&request);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionError::Upstream {
                status: status.to_string(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        Ok(CompletionResponse {
            choices: completion
                .choices
                .into_iter()
                .map(|c| Choice {
                    text: c.message.content.unwrap_or_default(),
                    stop_reason: c.finish_reason,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
