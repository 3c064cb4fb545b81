//! 循环状态与结果
//!
//! LoopState 是 AgentSession 在两次调用之间需要保留的全部「控制」状态；
//! 暂停时把当前批次（调用列表、游标、已生成的响应）存入 PausedState，恢复只依赖这份快照与人的决定。

use serde::{Deserialize, Serialize};

use crate::core::OperationId;
use crate::memory::{Args, Part};

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Args,
}

/// 正在处理的批次
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub calls: Vec<ToolCall>,
    /// 当前（暂停中的）调用下标
    pub cursor: usize,
    /// 已生成的响应；暂停时 responses[cursor] 为占位
    pub responses: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseKind {
    Approval { operation_id: OperationId },
    Feedback { request: String },
}

/// 暂停快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedState {
    pub kind: PauseKind,
    pub batch: BatchState,
    pub task_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration: u32,
    pub task_id: String,
    pub paused: Option<PausedState>,
    /// 本轮模型输出的文本（多次迭代以空行连接）
    pub accumulated_text: String,
    /// 本轮连续被熔断拦截的批次数
    pub blocked_batches: u32,
}

impl LoopState {
    pub fn push_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.accumulated_text.is_empty() {
            self.accumulated_text.push_str("\n\n");
        }
        self.accumulated_text.push_str(text);
    }
}

/// 一次 start / continue / resume 的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopResult {
    Completed {
        text: String,
        iterations: u32,
    },
    AwaitingApproval {
        operation_id: OperationId,
        tool_name: String,
        data: Args,
        iterations: u32,
    },
    AwaitingFeedback {
        tool_name: String,
        request: String,
        iterations: u32,
    },
    Failed {
        error: String,
        suggestion: Option<String>,
        iterations: u32,
    },
}

impl LoopResult {
    pub fn failed(error: impl Into<String>, iterations: u32) -> Self {
        LoopResult::Failed {
            error: error.into(),
            suggestion: None,
            iterations,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, LoopResult::Completed { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            LoopResult::AwaitingApproval { .. } | LoopResult::AwaitingFeedback { .. }
        )
    }

    pub fn iterations(&self) -> u32 {
        match self {
            LoopResult::Completed { iterations, .. }
            | LoopResult::AwaitingApproval { iterations, .. }
            | LoopResult::AwaitingFeedback { iterations, .. }
            | LoopResult::Failed { iterations, .. } => *iterations,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoopResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            LoopResult::Completed { text, .. } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_text_joins_with_blank_line() {
        let mut state = LoopState::default();
        state.push_text("first");
        state.push_text("   ");
        state.push_text("second");
        assert_eq!(state.accumulated_text, "first\n\nsecond");
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let result = LoopResult::failed("boom", 3);
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(result.iterations(), 3);
        assert_eq!(result.error(), Some("boom"));
    }
}
