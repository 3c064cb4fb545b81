//! Mock / 脚本化 LLM 客户端（用于本地演示与测试，无需 API）
//!
//! MockLlmClient：收到用户消息先读一次 Workspace，收到工具结果后给出文字回复。
//! ScriptedLlmClient：按顺序返回预设回复，并记录每次调用时的完整历史。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Args, Message, Part, Role};

/// Mock 客户端：先调用 read_instance，再回显观察结果
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn invoke(&self, history: &[Message]) -> Result<Message, LlmError> {
        let last = history
            .last()
            .ok_or_else(|| LlmError::InvalidResponse("empty history".to_string()))?;
        if last.role == Role::Tool {
            let observed = serde_json::to_string(&last.parts).unwrap_or_default();
            let preview: String = observed.chars().take(300).collect();
            return Ok(Message::model(vec![Part::text(format!(
                "Mock observation: {preview}"
            ))]));
        }
        let mut args = Args::new();
        args.insert("path".into(), json!("Workspace"));
        Ok(Message::model(vec![
            Part::text(format!("Mock plan for: {}", last.text())),
            Part::call("read_instance", args),
        ]))
    }
}

/// 脚本化客户端：依次弹出预设结果；脚本耗尽时返回错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<Message, LlmError>>>,
    invocations: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: Message) {
        self.lock_replies().push_back(Ok(reply));
    }

    pub fn push_error(&self, error: LlmError) {
        self.lock_replies().push_back(Err(error));
    }

    /// 已被调用的次数
    pub fn invocation_count(&self) -> usize {
        self.lock_invocations().len()
    }

    /// 第 n 次调用时看到的历史
    pub fn history_at(&self, n: usize) -> Option<Vec<Message>> {
        self.lock_invocations().get(n).cloned()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Message, LlmError>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_invocations(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Message>>> {
        self.invocations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn invoke(&self, history: &[Message]) -> Result<Message, LlmError> {
        self.lock_invocations().push(history.to_vec());
        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Request("script exhausted".to_string())))
    }
}
