//! LLM 层：模型客户端与摘要函数抽象，以及 Mock / 脚本化实现

pub mod mock;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use traits::{LlmClient, LlmError, ModelSummarizer, Summarizer};
