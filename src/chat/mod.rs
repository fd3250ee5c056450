//! Conversation state: messages, bounded buffers and the session registry

pub mod buffer;
pub mod models;
pub mod registry;

pub use buffer::{Checkpoint, ConversationBuffer};
pub use models::{accounted_length, Message, Role, SYSTEM_MESSAGE_CAP, USER_MESSAGE_CAP};
pub use registry::{Session, SessionRegistry};
