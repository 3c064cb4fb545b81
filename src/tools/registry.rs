//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / category / execute），由 ToolRegistry 按名注册与查找；
//! 注册时校验名称非空、不重复、参数 schema 为 object。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{AgentError, OperationId, PendingOperation, ToolError};
use crate::memory::Args;

/// 工具类别，决定执行器的路由方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// 只读，立即执行
    Read,
    /// 写操作：先校验前置条件并入审批队列，批准后才真正执行
    Write,
    /// 项目记忆读写，立即执行
    Project,
}

/// 工具执行结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub result: Args,
    /// 已入审批队列的操作 ID
    pub pending: Option<OperationId>,
    /// 需要用户自由文本反馈时的提问
    pub feedback_request: Option<String>,
    /// 经历过失败重试后才成功
    pub recovered: bool,
}

impl ToolOutput {
    pub fn new(result: Args) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn pending(id: OperationId, result: Args) -> Self {
        Self {
            result,
            pending: Some(id),
            ..Self::default()
        }
    }

    pub fn awaiting_feedback(request: impl Into<String>, result: Args) -> Self {
        Self {
            result,
            feedback_request: Some(request.into()),
            ..Self::default()
        }
    }

    /// 转为 FunctionResponse 的 response 对象
    pub fn to_response(&self) -> Args {
        let mut response = self.result.clone();
        if let Some(id) = self.pending {
            response.insert("pending".into(), json!(true));
            response.insert("operation_id".into(), json!(id));
        }
        if let Some(request) = &self.feedback_request {
            response.insert("awaiting_feedback".into(), json!(true));
            response.insert("feedback_request".into(), json!(request));
        }
        if self.recovered {
            response.insert("recovered".into(), json!(true));
        }
        response
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、类别、参数 schema、异步执行（args 为 JSON 对象）
///
/// Write 类工具的 execute 即「真正落地」，只在审批通过后由执行器调用。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    /// 参数 JSON Schema；`required` 数组用于调用前的结构校验
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 成功结果中必须存在且非空的字段（如读脚本必须带 source）
    fn required_output_field(&self) -> Option<&str> {
        None
    }

    /// Write 工具入队前的前置条件校验；queued 为当前任务中仍待审批的操作
    async fn check_preconditions(
        &self,
        _args: &Args,
        _queued: &[PendingOperation],
    ) -> Result<(), ToolError> {
        Ok(())
    }

    /// 执行工具
    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return Err(AgentError::InvalidTool("empty tool name".to_string()));
        }
        if tool.parameters_schema().get("type").and_then(Value::as_str) != Some("object") {
            return Err(AgentError::InvalidTool(format!(
                "{name}: parameters schema must be an object"
            )));
        }
        if self.tools.contains_key(&name) {
            return Err(AgentError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 动态生成工具 schema JSON（供调用方拼 prompt 或转成厂商 function 声明）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "category": tool.category(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        async fn execute(&self, _args: &Args) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::default())
        }
    }

    #[test]
    fn test_register_rejects_empty_and_duplicate() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("read_instance")).unwrap();
        assert!(matches!(
            registry.register(Named("read_instance")),
            Err(AgentError::DuplicateTool(_))
        ));
        assert!(matches!(
            registry.register(Named("  ")),
            Err(AgentError::InvalidTool(_))
        ));
        assert_eq!(registry.tool_names(), vec!["read_instance".to_string()]);
    }

    #[test]
    fn test_schema_json_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("b_tool")).unwrap();
        registry.register(Named("a_tool")).unwrap();
        let schema: Value = serde_json::from_str(&registry.to_schema_json()).unwrap();
        assert_eq!(schema[0]["name"], "a_tool");
        assert_eq!(schema[1]["category"], "read");
    }

    #[test]
    fn test_output_to_response_flags() {
        let out = ToolOutput::pending(7, Args::new());
        let response = out.to_response();
        assert_eq!(response["pending"], json!(true));
        assert_eq!(response["operation_id"], json!(7));
    }
}
