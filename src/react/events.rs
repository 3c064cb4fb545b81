//! 循环过程事件：供调用方实时展示迭代、思考、工具调用、熔断、压缩与暂停

use serde::Serialize;

use crate::core::OperationId;
use crate::memory::{Args, CompressionOutcome};

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    IterationStarted { iteration: u32, max_iterations: u32 },
    /// 模型的自由文本
    Thinking { text: String },
    ToolCall { tool: String, args: Args },
    /// 工具返回（预览，避免过长）
    ToolResult {
        tool: String,
        ok: bool,
        preview: String,
    },
    CircuitBlocked { tool: String, retry_in_ms: u64 },
    Compressed { outcome: CompressionOutcome },
    AwaitingApproval { operation_id: OperationId, tool: String },
    AwaitingFeedback { tool: String, request: String },
    Error { text: String },
}
