//! 记忆层：对话历史（含压缩）、token 估算、会话快照持久化

pub mod conversation;
pub mod persistence;
pub mod token_budget;

pub use conversation::{
    Args, CompressionConfig, CompressionOutcome, ConversationHistory, Message, Part, Role,
};
pub use persistence::{InMemorySessionStore, JsonFileStore, SessionSnapshot, SessionStore};
pub use token_budget::{TokenEstimator, FUNCTION_CALL_TOKENS};
