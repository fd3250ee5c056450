//! Reply orchestration over the session registry
//!
//! One `get_reply` call locks the session, appends the user message, drives
//! the completion endpoints through the retry table and appends the accepted
//! reply. Every failure after the append restores the buffer, so failed
//! turns leave no trace in the history.

pub mod endpoint;
pub mod retry;

pub use endpoint::{Endpoint, EndpointSelector};
pub use retry::{FailureClass, RetryAction, RetryPolicy};

use crate::chat::{ConversationBuffer, Role, SessionRegistry};
use crate::completion::{
    Choice, CompletionClient, CompletionResponse, GenerationOptions, OpenAiClient,
};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::metrics::METRICS;
use crate::snapshot::{DialogMessage, SessionSnapshot};
use futures::future::join_all;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An accepted model reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// False when generation stopped at the output limit
    pub at_end: bool,
    /// History cost after the reply was appended
    pub context_len: usize,
    /// Accounted length of the reply
    pub reply_len: usize,
    /// Endpoint that produced the reply
    pub endpoint: Endpoint,
}

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// History cost budget per session (0 = unlimited)
    pub max_cost: usize,
    /// Cap on the accounted length of one reply
    pub max_reply_cost: usize,
    /// Idle time after which an unforced message restarts the conversation
    pub memory: Duration,
    /// Idle time after which a session leaves the registry
    pub registry_idle: Duration,
    /// Length of one backoff unit
    pub backoff_unit: Duration,
    pub options: GenerationOptions,
    pub policy: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_cost: 0,
            max_reply_cost: 1024,
            memory: Duration::from_secs(1800),
            registry_idle: Duration::from_secs(86400),
            backoff_unit: Duration::from_secs(1),
            options: GenerationOptions::default(),
            policy: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let completion = &config.completion;
        Self {
            max_cost: completion.history_budget(),
            max_reply_cost: completion.max_output_tokens,
            memory: config.session.memory(),
            registry_idle: config.session.registry_idle(),
            backoff_unit: completion.backoff_unit(),
            options: completion.generation_options(),
            policy: RetryPolicy::default().with_max_attempts(completion.max_attempts),
        }
    }
}

/// Drives sessions against a primary and a fallback completion endpoint
pub struct ChatOrchestrator {
    primary: Arc<dyn CompletionClient>,
    fallback: Arc<dyn CompletionClient>,
    registry: SessionRegistry,
    endpoints: EndpointSelector,
    settings: OrchestratorSettings,
}

impl ChatOrchestrator {
    pub fn new(
        primary: Arc<dyn CompletionClient>,
        fallback: Arc<dyn CompletionClient>,
        settings: OrchestratorSettings,
    ) -> Self {
        let registry = SessionRegistry::new(settings.max_cost, settings.registry_idle);
        Self {
            primary,
            fallback,
            registry,
            endpoints: EndpointSelector::new(),
            settings,
        }
    }

    /// Build both endpoints from the completion configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let completion = &config.completion;

        info!(
            provider = %completion.provider,
            base_url = %completion.base_url,
            api_key_set = completion
                .api_key
                .as_ref()
                .map(|k| !k.expose_secret().is_empty())
                .unwrap_or(false),
            model = %completion.model,
            fallback_model = %completion.fallback_model(),
            temperature = completion.temperature,
            top_k = ?completion.top_k,
            repetition_penalty = ?completion.repetition_penalty,
            max_tokens = completion.max_output_tokens,
            stop = ?completion.stop,
            "creating completion clients"
        );

        let primary = OpenAiClient::new(
            &completion.base_url,
            completion.api_key.clone(),
            &completion.model,
            completion.timeout(),
        )?;
        let fallback = OpenAiClient::new(
            &completion.base_url,
            completion.api_key.clone(),
            completion.fallback_model(),
            completion.timeout(),
        )?;

        Ok(Self::new(
            Arc::new(primary),
            Arc::new(fallback),
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Endpoint new requests are routed to
    pub fn active_endpoint(&self) -> Endpoint {
        self.endpoints.current()
    }

    pub async fn has_session(&self, session_id: i64) -> bool {
        self.registry.has(session_id).await
    }

    /// Start (or replace) a session with a system prompt
    pub async fn start_session(&self, session_id: i64, prompt: &str, max_history: usize) {
        self.registry.create(session_id, prompt, max_history).await;
        info!(session_id, max_history, "chat started");
    }

    /// Start a session unless one is live, returning true when it was created
    ///
    /// Sessions leave the registry after the idle window, so front-ends call
    /// this before each message to bring an expired session back.
    pub async fn ensure_session(&self, session_id: i64, prompt: &str, max_history: usize) -> bool {
        if self.registry.has(session_id).await {
            return false;
        }
        self.start_session(session_id, prompt, max_history).await;
        true
    }

    /// Drop the history of a session, keeping its prompt
    pub async fn restart_session(&self, session_id: i64) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(ChatError::SessionNotFound(session_id))?;
        session.lock().await.restart();
        Ok(())
    }

    /// Ask the model for a reply to `text` in the given session
    ///
    /// Waits for any in-flight request of the same session. Unless
    /// `force_keep_history` is set, a session idle for longer than the
    /// memory window starts over from its system prompt.
    pub async fn get_reply(
        &self,
        session_id: i64,
        text: &str,
        force_keep_history: bool,
    ) -> Result<Reply> {
        let start = Instant::now();

        let result = self.reply(session_id, text, force_keep_history).await;

        match &result {
            Ok(reply) => {
                METRICS.replies.with_label_values(&["success"]).inc();
                METRICS.reply_length.observe(reply.reply_len as f64);
                METRICS.context_length.observe(reply.context_len as f64);
                METRICS
                    .reply_duration
                    .with_label_values(&[reply.endpoint.as_str()])
                    .observe(start.elapsed().as_secs_f64());

                info!(
                    session_id,
                    size = reply.reply_len,
                    at_end = reply.at_end,
                    endpoint = %reply.endpoint,
                    dur_ms = %format!("{:.2}", start.elapsed().as_secs_f64() * 1000.0),
                    "ai message"
                );
            }
            Err(e) => {
                METRICS.replies.with_label_values(&[e.kind()]).inc();
            }
        }

        result
    }

    async fn reply(&self, session_id: i64, text: &str, force_keep_history: bool) -> Result<Reply> {
        let session = match self.registry.get(session_id).await {
            Some(session) => session,
            None => {
                warn!(session_id, "chat is not started");
                return Err(ChatError::SessionNotFound(session_id));
            }
        };

        let mut buffer = session.lock().await;

        if !force_keep_history && buffer.is_expired(self.settings.memory) {
            debug!(session_id, "conversation expired, restarting");
            buffer.restart();
        }

        let checkpoint = buffer.checkpoint();
        buffer.append_user(text);

        let (choice, endpoint) = match self.generate(session_id, &mut buffer).await {
            Ok(served) => served,
            Err(e) => {
                buffer.rollback(checkpoint);
                return Err(e);
            }
        };

        let at_end = choice.at_end();
        buffer.append_assistant(choice.text.as_str(), self.settings.max_reply_cost);

        Ok(Reply {
            reply_len: buffer.last_message_cost(),
            context_len: buffer.cur_cost(),
            at_end,
            endpoint,
            text: choice.text,
        })
    }

    /// Run the bounded retry loop until a usable choice comes back, along
    /// with the endpoint that produced it
    async fn generate(
        &self,
        session_id: i64,
        buffer: &mut ConversationBuffer,
    ) -> Result<(Choice, Endpoint)> {
        let policy = &self.settings.policy;

        for attempt in 1..=policy.max_attempts {
            let endpoint = self.endpoints.current();
            let client = self.client(endpoint);

            let err = match client.complete(buffer.messages(), &self.settings.options).await {
                Ok(response) => return accept_choice(session_id, response).map(|c| (c, endpoint)),
                Err(e) => e,
            };

            let class = policy.classify(&err.to_string());
            METRICS
                .completion_failures
                .with_label_values(&[class.as_str()])
                .inc();
            let last_attempt = attempt == policy.max_attempts;

            match policy.action(class, attempt, endpoint) {
                RetryAction::Backoff(units) => {
                    if !last_attempt {
                        info!(session_id, attempt, units, "sleeping");
                        tokio::time::sleep(self.units(units)).await;
                    }
                }
                RetryAction::EvictAndWait(units) => {
                    evict_before_pending(buffer);
                    if !last_attempt {
                        info!(session_id, attempt, units, "sleeping");
                        tokio::time::sleep(self.units(units)).await;
                    }
                }
                RetryAction::EvictAndFailover(units) => {
                    evict_before_pending(buffer);
                    info!(session_id, units, "switching to fallback model");
                    METRICS.failovers.inc();
                    self.endpoints.fail_over(self.units(units));
                }
                RetryAction::Abort => {
                    warn!(session_id, attempt, model = client.model(), error = %err, "completion failed");
                    return Err(match class {
                        FailureClass::MalformedWaitHint => ChatError::MalformedWaitHint(err.to_string()),
                        _ => ChatError::Completion(err),
                    });
                }
            }
        }

        warn!(session_id, attempts = policy.max_attempts, "giving up on completion");
        Err(ChatError::RetriesExhausted {
            attempts: policy.max_attempts,
        })
    }

    fn client(&self, endpoint: Endpoint) -> &dyn CompletionClient {
        match endpoint {
            Endpoint::Primary => self.primary.as_ref(),
            Endpoint::Fallback => self.fallback.as_ref(),
        }
    }

    fn units(&self, units: u64) -> Duration {
        self.settings
            .backoff_unit
            .saturating_mul(u32::try_from(units).unwrap_or(u32::MAX))
    }

    /// Dump every live session, system prompt first, in session id order
    pub async fn export_sessions(&self) -> SessionSnapshot {
        let mut sessions = self.registry.snapshot_all();
        sessions.sort_by_key(|(id, _)| *id);

        let dumps = join_all(sessions.iter().map(|(id, session)| async move {
            let buffer = session.lock().await;
            (*id, buffer.messages().to_vec(), buffer.max_count())
        }))
        .await;

        let mut messages = Vec::new();
        let mut max_history = HashMap::new();
        for (session_id, history, max_count) in dumps {
            max_history.insert(session_id, max_count);
            messages.extend(history.into_iter().map(|m| DialogMessage {
                session_id,
                role: m.role,
                text: m.text,
            }));
        }

        SessionSnapshot::new(messages, max_history)
    }

    /// Recreate sessions from a snapshot, returning how many were created
    ///
    /// A system message, or the first message of a new session id, starts a
    /// session with that text as prompt. Turns are appended with the normal
    /// caps, so the current limits apply to restored history.
    pub async fn import_sessions(&self, snapshot: &SessionSnapshot) -> usize {
        let mut created = 0;
        let mut current = None;

        for message in &snapshot.messages {
            let same_session = matches!(&current, Some((id, _)) if *id == message.session_id);

            if !same_session || message.role == Role::System {
                let max_history = snapshot
                    .max_history
                    .get(&message.session_id)
                    .copied()
                    .unwrap_or(0);
                let session = self
                    .registry
                    .create(message.session_id, &message.text, max_history)
                    .await;
                current = Some((message.session_id, session));
                created += 1;
                continue;
            }

            if let Some((_, session)) = &current {
                let mut buffer = session.lock().await;
                match message.role {
                    Role::User => buffer.append_user(message.text.as_str()),
                    _ => buffer.append_assistant(message.text.as_str(), self.settings.max_reply_cost),
                }
            }
        }

        info!(sessions = created, messages = snapshot.messages.len(), "sessions restored");
        created
    }

    /// Cancel the scheduled revert and route to the primary endpoint
    pub fn shutdown(&self) {
        self.endpoints.reset();
    }
}

/// Evict older turns but never the user message awaiting a reply
fn evict_before_pending(buffer: &mut ConversationBuffer) {
    if buffer.turn_count() > 1 {
        buffer.clean_history();
    }
}

fn accept_choice(session_id: i64, response: CompletionResponse) -> Result<Choice> {
    let count = response.choices.len();
    let Some(choice) = response.choices.into_iter().next() else {
        warn!(session_id, "no content returned from model");
        return Err(ChatError::EmptyCompletion);
    };

    if count > 1 {
        warn!(session_id, count, "model returned several choices instead of one");
    }

    if choice.text.is_empty() {
        warn!(session_id, "model reply content is empty");
        return Err(ChatError::EmptyCompletion);
    }

    Ok(choice)
}
