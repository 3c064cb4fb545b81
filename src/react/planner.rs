//! 模型输出解析与调用前校验
//!
//! split_response 把一条 Model 消息拆成「思考文本」与按序的工具调用；
//! validate_call 在执行前拦截未知工具、缺失必填参数、对已过期路径的写操作。

use serde_json::Value;

use crate::core::{ErrorCategory, ToolCall, ToolError};
use crate::memory::{Message, Part};
use crate::tools::{target_path, ToolCategory, ToolRegistry, ToolResilience};

/// 拆分模型回复：文本片段以换行连接，FunctionCall 保持原顺序
pub fn split_response(message: &Message) -> (String, Vec<ToolCall>) {
    let mut text = Vec::new();
    let mut calls = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text { text: t } if !t.trim().is_empty() => text.push(t.as_str()),
            Part::FunctionCall { name, args } => calls.push(ToolCall {
                name: name.clone(),
                args: args.clone(),
            }),
            _ => {}
        }
    }
    (text.join("\n"), calls)
}

/// 执行前校验
pub fn validate_call(
    call: &ToolCall,
    registry: &ToolRegistry,
    resilience: &ToolResilience,
) -> Result<(), ToolError> {
    let Some(tool) = registry.get(&call.name) else {
        return Err(ToolError::new(
            ErrorCategory::MissingResource,
            format!(
                "unknown tool `{}`; available tools: {}",
                call.name,
                registry.tool_names().join(", ")
            ),
        ));
    };

    let schema = tool.parameters_schema();
    let missing: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|field| call.args.get(*field).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ToolError::new(
            ErrorCategory::TypeError,
            format!(
                "invalid type for `{}`: missing required parameter(s) {}",
                call.name,
                missing.join(", ")
            ),
        ));
    }

    if tool.category() == ToolCategory::Write {
        if let Some(path) = target_path(&call.args).filter(|p| resilience.is_stale(p)) {
            return Err(ToolError::new(
                ErrorCategory::MissingResource,
                format!("`{path}` no longer matches what was last read; re-read it before writing"),
            ));
        }
    }
    Ok(())
}
