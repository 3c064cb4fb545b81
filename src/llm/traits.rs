//! LLM 客户端抽象
//!
//! 编排层只依赖 invoke(history) -> Message 这一形状；具体厂商协议不在本 crate 范围内。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{Message, Role};

/// 模型调用错误；编排层原样透传 Display 文本
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("{0}")]
    Request(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// LLM 客户端 trait：给定完整历史，返回一条 Model 消息（文本与 FunctionCall 片段）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, history: &[Message]) -> Result<Message, LlmError>;
}

/// 摘要函数：把最旧的一段消息压成一段文字；不可用时返回 None
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Option<String>;
}

/// 用同一个 LLM 生成摘要
pub struct ModelSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl ModelSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        let transcript = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Model => "model",
                    Role::Tool => "tool",
                    Role::System => "system",
                };
                let body = serde_json::to_string(&m.parts).unwrap_or_default();
                format!("{role}: {body}")
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = Message::user(format!(
            "Summarize the following conversation in a few short paragraphs. Keep created \
             instance paths, decisions and unresolved errors. Reply with the summary only.\n\n{transcript}"
        ));
        match self.llm.invoke(std::slice::from_ref(&prompt)).await {
            Ok(reply) => {
                let text = reply.text();
                (!text.trim().is_empty()).then_some(text)
            }
            Err(e) => {
                tracing::warn!(error = %e, "summary request failed");
                None
            }
        }
    }
}
