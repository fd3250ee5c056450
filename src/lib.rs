//! Concurrent chat sessions against a remote completion service
//!
//! Each session keeps a bounded conversation buffer inside a registry with
//! sliding expiration. The orchestrator sends the buffer to the primary
//! model, recovers from throttling with backoff, history eviction and a
//! temporary switch to a fallback model, and rolls failed turns back.

pub mod chat;
pub mod completion;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod sanitize;
pub mod snapshot;

pub use chat::{ConversationBuffer, Message, Role, SessionRegistry};
pub use completion::{Choice, CompletionClient, CompletionError, CompletionResponse, GenerationOptions};
pub use config::Config;
pub use error::{ChatError, Result};
pub use orchestrator::{ChatOrchestrator, Endpoint, OrchestratorSettings, Reply};
pub use sanitize::escape_markdown;
pub use snapshot::{DialogMessage, JsonFileStore, SessionSnapshot, SnapshotStore};
