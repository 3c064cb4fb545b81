//! 短期记忆：对话历史
//!
//! 只追加的消息日志（User / Model / Tool / System），提供 token 估算与多策略压缩。
//! 不变量：Tool 消息只含 FunctionResponse，且与紧邻的上一条 Model 消息中的 FunctionCall 一一对应、顺序一致；
//! 压缩边界绝不把 Model 消息与其配对的 Tool 消息拆开。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::Summarizer;
use crate::memory::TokenEstimator;

/// 工具参数 / 工具返回统一使用 JSON 对象
pub type Args = Map<String, Value>;

/// 摘要消息前缀
const SUMMARY_PREFIX: &str = "[Conversation summary]";

/// 消息角色；System 仅用于压缩后生成的摘要消息
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
    System,
}

/// 消息片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall { name: String, args: Args },
    FunctionResponse { name: String, response: Args },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn call(name: impl Into<String>, args: Args) -> Self {
        Part::FunctionCall {
            name: name.into(),
            args,
        }
    }

    pub fn response(name: impl Into<String>, response: Args) -> Self {
        Part::FunctionResponse {
            name: name.into(),
            response,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    /// Tool 消息：parts 应全部为 FunctionResponse
    pub fn tool(responses: Vec<Part>) -> Self {
        Self {
            role: Role::Tool,
            parts: responses,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::text(text)],
        }
    }

    /// 拼接所有 Text 片段
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn function_call_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::FunctionCall { .. }))
            .count()
    }

    pub fn function_response_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::FunctionResponse { .. }))
            .count()
    }
}

/// 压缩配置
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// 估算 token 超过该值才压缩
    pub token_threshold: usize,
    /// 原样保留的最近消息条数
    pub messages_to_preserve: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            token_threshold: 24_000,
            messages_to_preserve: 10,
        }
    }
}

/// 压缩结果（用于日志与事件）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CompressionOutcome {
    NotNeeded,
    /// AI 摘要替换了最旧的 removed 条消息
    Summarized {
        removed: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// 摘要不可用，机械截断并留下占位消息
    Truncated {
        removed: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
}

/// 对话历史：只追加；压缩时以一条 System 消息替换最旧的前缀
#[derive(Clone, Debug, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    config: CompressionConfig,
}

impl ConversationHistory {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            messages: Vec::new(),
            config,
        }
    }

    /// 从快照恢复
    pub fn from_messages(messages: Vec<Message>, config: CompressionConfig) -> Self {
        Self { messages, config }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimate_tokens(&self) -> usize {
        TokenEstimator::estimate_messages(&self.messages)
    }

    /// 检查 FunctionCall / FunctionResponse 配对不变量
    ///
    /// 末尾带调用、尚无响应的 Model 消息视为暂停中的批次，不算违例。
    pub fn pairing_is_consistent(&self) -> bool {
        let mut prev_calls: Option<usize> = None;
        for msg in &self.messages {
            match msg.role {
                Role::Tool => {
                    if msg.function_response_count() != msg.parts.len() {
                        return false;
                    }
                    if prev_calls != Some(msg.parts.len()) {
                        return false;
                    }
                    prev_calls = None;
                }
                _ if prev_calls.is_some() => return false,
                Role::Model => {
                    let calls = msg.function_call_count();
                    prev_calls = (calls > 0).then_some(calls);
                }
                _ => {}
            }
        }
        true
    }

    /// 超过阈值时压缩：优先 AI 摘要，失败则机械截断；始终保留最近 messages_to_preserve 条
    pub async fn compress_if_needed(
        &mut self,
        summarizer: Option<&dyn Summarizer>,
    ) -> CompressionOutcome {
        let tokens_before = self.estimate_tokens();
        if tokens_before <= self.config.token_threshold {
            return CompressionOutcome::NotNeeded;
        }
        let Some(split) = self.compression_boundary() else {
            return CompressionOutcome::NotNeeded;
        };
        let tail_tokens = TokenEstimator::estimate_messages(&self.messages[split..]);

        if let Some(summarizer) = summarizer {
            match summarizer.summarize(&self.messages[..split]).await {
                Some(summary) if !summary.trim().is_empty() => {
                    let msg = Message::system(format!("{SUMMARY_PREFIX}\n\n{}", summary.trim()));
                    let tokens_after = tail_tokens + TokenEstimator::estimate_message(&msg);
                    if tokens_after <= self.config.token_threshold {
                        self.replace_prefix(split, msg);
                        tracing::info!(
                            removed = split,
                            tokens_before,
                            tokens_after,
                            "history compressed with summary"
                        );
                        return CompressionOutcome::Summarized {
                            removed: split,
                            tokens_before,
                            tokens_after,
                        };
                    }
                    tracing::warn!(tokens_after, "summary exceeds budget, truncating instead");
                }
                _ => tracing::warn!("summarizer unavailable, truncating history"),
            }
        }

        let msg = Message::system(format!(
            "[Earlier conversation truncated: {split} messages omitted to stay within the context budget]"
        ));
        let tokens_after = tail_tokens + TokenEstimator::estimate_message(&msg);
        self.replace_prefix(split, msg);
        if tokens_after > self.config.token_threshold {
            tracing::warn!(tokens_after, "preserved messages alone exceed the token threshold");
        }
        tracing::info!(removed = split, tokens_before, tokens_after, "history truncated");
        CompressionOutcome::Truncated {
            removed: split,
            tokens_before,
            tokens_after,
        }
    }

    /// 计算压缩边界：[0, split) 被替换；Tool 消息必须与上一条 Model 消息留在同侧
    fn compression_boundary(&self) -> Option<usize> {
        let len = self.messages.len();
        if len <= self.config.messages_to_preserve {
            return None;
        }
        let mut split = len - self.config.messages_to_preserve;
        while split > 0 && self.messages[split].role == Role::Tool {
            split -= 1;
        }
        if split == 0 {
            return None;
        }
        // 待移除部分只剩上次的摘要，再压缩也不会变小
        if self.messages[..split].iter().all(|m| m.role == Role::System) {
            return None;
        }
        Some(split)
    }

    fn replace_prefix(&mut self, split: usize, replacement: Message) {
        self.messages.splice(..split, std::iter::once(replacement));
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct FixedSummarizer(Option<String>);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Option<String> {
            self.0.clone()
        }
    }

    fn args(path: &str) -> Args {
        let mut a = Args::new();
        a.insert("path".into(), json!(path));
        a
    }

    /// 构造 rounds 轮 user -> model(call) -> tool(response)，另加一条 model 文本
    fn build_history(rounds: usize, config: CompressionConfig) -> ConversationHistory {
        let mut history = ConversationHistory::new(config);
        for i in 0..rounds {
            history.append(Message::user(format!("step {i}: please inspect the workspace")));
            history.append(Message::model(vec![
                Part::text("Reading."),
                Part::call("read_instance", args(&format!("Workspace/Part{i}"))),
            ]));
            let mut resp = Args::new();
            resp.insert("class_name".into(), json!("Part"));
            resp.insert("content".into(), json!("x".repeat(200)));
            history.append(Message::tool(vec![Part::response("read_instance", resp)]));
        }
        history
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let mut history = build_history(2, CompressionConfig::default());
        let before = history.messages().to_vec();
        let outcome = history.compress_if_needed(None).await;
        assert_eq!(outcome, CompressionOutcome::NotNeeded);
        assert_eq!(history.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn test_summary_preserves_tail_and_pairing() {
        let config = CompressionConfig {
            token_threshold: 1_000,
            messages_to_preserve: 10,
        };
        let mut history = build_history(40, config);
        assert!(history.estimate_tokens() > 1_000);
        let tail: Vec<Message> = history.messages()[history.len() - 10..].to_vec();

        let summarizer = FixedSummarizer(Some("User inspected forty parts.".into()));
        let outcome = history.compress_if_needed(Some(&summarizer)).await;

        assert!(matches!(outcome, CompressionOutcome::Summarized { .. }));
        assert_eq!(history.messages()[0].role, Role::System);
        assert!(history.messages()[0].text().contains("forty parts"));
        let kept = &history.messages()[history.len() - 10..];
        assert_eq!(kept, tail.as_slice());
        assert!(history.pairing_is_consistent());
        assert!(history.estimate_tokens() <= 1_000);
    }

    #[tokio::test]
    async fn test_boundary_never_splits_model_and_tool() {
        // 120 条消息，保留 10 条：len-10 = 110，messages[110] 为 Tool（110 % 3 == 2）
        let config = CompressionConfig {
            token_threshold: 500,
            messages_to_preserve: 10,
        };
        let mut history = build_history(40, config);
        assert_eq!(history.messages()[110].role, Role::Tool);

        history.compress_if_needed(None).await;
        // 边界回退一条：保留 11 条 + 1 条占位
        assert_eq!(history.len(), 12);
        assert_eq!(history.messages()[1].role, Role::Model);
        assert!(history.pairing_is_consistent());
    }

    #[tokio::test]
    async fn test_fallback_truncation_when_summary_fails() {
        let config = CompressionConfig {
            token_threshold: 800,
            messages_to_preserve: 10,
        };
        let mut history = build_history(30, config);
        let outcome = history.compress_if_needed(Some(&FixedSummarizer(None))).await;
        match outcome {
            CompressionOutcome::Truncated { removed, .. } => assert!(removed > 0),
            other => panic!("expected truncation, got {other:?}"),
        }
        assert!(history.messages()[0].text().contains("messages omitted"));
        assert!(history.pairing_is_consistent());
    }

    #[tokio::test]
    async fn test_oversized_summary_falls_back_to_truncation() {
        let config = CompressionConfig {
            token_threshold: 600,
            messages_to_preserve: 10,
        };
        let mut history = build_history(30, config);
        let huge = FixedSummarizer(Some("y".repeat(10_000)));
        let outcome = history.compress_if_needed(Some(&huge)).await;
        assert!(matches!(outcome, CompressionOutcome::Truncated { .. }));
        assert!(history.estimate_tokens() <= 600);
    }

    #[tokio::test]
    async fn test_two_hundred_messages_compress_once() {
        let config = CompressionConfig {
            token_threshold: 2_000,
            messages_to_preserve: 10,
        };
        let mut history = ConversationHistory::new(config);
        for i in 0..200 {
            if i % 2 == 0 {
                history.append(Message::user(format!("question {i} {}", "q".repeat(80))));
            } else {
                history.append(Message::model(vec![Part::text(format!(
                    "answer {i} {}",
                    "a".repeat(80)
                ))]));
            }
        }
        let tail: Vec<Message> = history.messages()[190..].to_vec();

        let first = history.compress_if_needed(None).await;
        assert!(matches!(first, CompressionOutcome::Truncated { removed: 190, .. }));
        assert_eq!(&history.messages()[1..], tail.as_slice());
        assert!(history.estimate_tokens() <= 2_000);

        let snapshot = history.messages().to_vec();
        let second = history.compress_if_needed(None).await;
        assert_eq!(second, CompressionOutcome::NotNeeded);
        assert_eq!(history.messages(), snapshot.as_slice());
    }

    #[test]
    fn test_pairing_detects_orphan_response() {
        let mut history = ConversationHistory::default();
        history.append(Message::user("hi"));
        history.append(Message::tool(vec![Part::response("read_instance", Args::new())]));
        assert!(!history.pairing_is_consistent());
    }

    #[test]
    fn test_pairing_detects_unanswered_calls() {
        let mut history = ConversationHistory::default();
        history.append(Message::user("hi"));
        history.append(Message::model(vec![Part::call("read_instance", args("Workspace"))]));
        // 末尾未响应的批次视为暂停中
        assert!(history.pairing_is_consistent());
        history.append(Message::user("never mind"));
        assert!(!history.pairing_is_consistent());
    }
}
