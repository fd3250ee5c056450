//! Configuration loading
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file,
//! `CHAT_RELAY__SECTION__KEY` environment variables (a `.env` file is read
//! first).

use crate::completion::GenerationOptions;
use crate::error::{ChatError, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Default configuration file name, without extension
pub const DEFAULT_CONFIG_PATH: &str = "chat-relay";

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "CHAT_RELAY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Load configuration from `path` (extension optional) plus environment
    pub fn from_file(path: &str) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Self::finish(settings.try_deserialize()?)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        Self::finish(settings.try_deserialize()?)
    }

    fn finish(mut config: Config) -> Result<Self> {
        if config.completion.api_key.is_none() {
            if let Ok(key) = std::env::var(&config.completion.api_key_env) {
                config.completion.api_key = Some(SecretString::new(key));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        let completion = &self.completion;

        if completion.provider != "openai" {
            return Err(ChatError::Config(format!(
                "unknown completion provider: {}",
                completion.provider
            )));
        }

        if completion.model.trim().is_empty() {
            return Err(ChatError::Config("completion model is required".to_string()));
        }

        if completion.max_attempts == 0 {
            return Err(ChatError::Config("max_attempts must be at least 1".to_string()));
        }

        if completion.context_size > 0 && completion.max_output_tokens >= completion.context_size {
            return Err(ChatError::Config(format!(
                "max_output_tokens ({}) must be below context_size ({})",
                completion.max_output_tokens, completion.context_size
            )));
        }

        Ok(())
    }
}

/// Completion provider settings
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    /// Provider protocol, only "openai" (any compatible endpoint)
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key; read from `api_key_env` when not set
    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Primary model
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used while the primary one is rate limited
    #[serde(default)]
    pub fallback_model: Option<String>,

    /// Model context window (0 = unlimited history)
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub top_k: Option<u32>,

    #[serde(default)]
    pub repetition_penalty: Option<f32>,

    #[serde(default)]
    pub stop: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Length of one backoff unit in milliseconds
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_provider() -> String { "openai".to_string() }
fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_api_key_env() -> String { "OPENAI_API_KEY".to_string() }
fn default_model() -> String { "gpt-4o".to_string() }
fn default_context_size() -> usize { 16384 }
fn default_max_output_tokens() -> usize { 1024 }
fn default_temperature() -> f32 { 0.7 }
fn default_timeout_secs() -> u64 { 120 }
fn default_max_attempts() -> u32 { 5 }
fn default_backoff_unit_ms() -> u64 { 1000 }

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            fallback_model: None,
            context_size: default_context_size(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            top_k: None,
            repetition_penalty: None,
            stop: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl CompletionConfig {
    /// History budget: the context window minus room for one reply
    pub fn history_budget(&self) -> usize {
        self.context_size.saturating_sub(self.max_output_tokens)
    }

    pub fn fallback_model(&self) -> &str {
        self.fallback_model.as_deref().unwrap_or(&self.model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            max_tokens: self.max_output_tokens,
            stop: self.stop.clone(),
        }
    }
}

/// Session lifetime settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a new message starts a fresh conversation
    #[serde(default = "default_memory_secs")]
    pub memory_secs: u64,

    /// Idle time after which a session is dropped from memory
    #[serde(default = "default_registry_idle_secs")]
    pub registry_idle_secs: u64,

    /// Retained user/assistant messages for new sessions (0 = unlimited)
    #[serde(default = "default_max_history")]
    pub default_max_history: usize,

    #[serde(default = "default_prompt")]
    pub default_prompt: String,
}

fn default_memory_secs() -> u64 { 1800 }
fn default_registry_idle_secs() -> u64 { 86400 }
fn default_max_history() -> usize { 20 }
fn default_prompt() -> String { "You are a helpful assistant.".to_string() }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_secs: default_memory_secs(),
            registry_idle_secs: default_registry_idle_secs(),
            default_max_history: default_max_history(),
            default_prompt: default_prompt(),
        }
    }
}

impl SessionConfig {
    pub fn memory(&self) -> Duration {
        Duration::from_secs(self.memory_secs)
    }

    pub fn registry_idle(&self) -> Duration {
        Duration::from_secs(self.registry_idle_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String { "info".to_string() }
fn default_format() -> String { "pretty".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// Session snapshot settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotConfig {
    /// JSON file the sessions are restored from and dumped to
    #[serde(default)]
    pub path: Option<String>,
}
