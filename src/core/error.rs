//! 错误类型
//!
//! AgentError：运行时/注册/持久化等调用方可见的错误；
//! ToolError：工具层错误，尽量携带结构化分类，无分类时再交给 ErrorClassifier 做文本匹配。

use std::time::Duration;

use thiserror::Error;

use crate::core::ErrorCategory;

/// Agent 运行时错误（不含工具失败：工具失败作为 FunctionResponse 回灌给模型）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 同一会话已有一轮在执行
    #[error("a turn is already in flight for this conversation")]
    TurnInFlight,

    /// Agent 后台任务已退出
    #[error("agent stopped")]
    AgentStopped,

    #[error("invalid tool registration: {0}")]
    InvalidTool(String),

    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// 工具执行错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolError {
    /// 工具自身给出的分类；None 表示来自不透明的外部传输，需要文本匹配
    pub category: Option<ErrorCategory>,
    pub message: String,
}

impl ToolError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            message: message.into(),
        }
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        Self {
            category: None,
            message: message.into(),
        }
    }

    pub fn timeout(tool_name: &str, after: Duration) -> Self {
        Self::opaque(format!(
            "tool `{tool_name}` timed out after {}ms",
            after.as_millis()
        ))
    }

    /// 附加建议文本（保留分类）
    pub fn with_hint(mut self, hint: impl AsRef<str>) -> Self {
        self.message = format!("{} ({})", self.message, hint.as_ref());
        self
    }
}
