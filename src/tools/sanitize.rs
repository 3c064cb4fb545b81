//! 工具输出清洗：去除 null、截断超长字符串、校验必需字段

use serde_json::{json, Value};

use crate::core::{ErrorCategory, ToolError};
use crate::memory::Args;
use crate::tools::ToolOutput;

/// 截断标记
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// 清洗工具输出；必需字段缺失或为空时降级为错误
pub fn sanitize_output(
    tool_name: &str,
    required_field: Option<&str>,
    mut output: ToolOutput,
    max_chars: usize,
) -> Result<ToolOutput, ToolError> {
    strip_nulls(&mut output.result);

    if let Some(field) = required_field {
        let present = match output.result.get(field) {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
            None => false,
        };
        if !present {
            return Err(ToolError::new(
                ErrorCategory::MissingResource,
                format!("{tool_name} reported success but returned no `{field}`"),
            ));
        }
    }

    let mut truncated = false;
    for value in output.result.values_mut() {
        truncated |= truncate_strings(value, max_chars);
    }
    if truncated {
        tracing::debug!(tool = tool_name, max_chars, "tool output truncated");
        output.result.insert("truncated".into(), json!(true));
    }
    Ok(output)
}

fn strip_nulls(map: &mut Args) {
    map.retain(|_, v| !v.is_null());
    for v in map.values_mut() {
        strip_nulls_value(v);
    }
}

fn strip_nulls_value(value: &mut Value) {
    match value {
        Value::Object(map) => strip_nulls(map),
        Value::Array(items) => {
            items.retain(|v| !v.is_null());
            items.iter_mut().for_each(strip_nulls_value);
        }
        _ => {}
    }
}

/// 递归截断；返回是否发生截断
fn truncate_strings(value: &mut Value, max_chars: usize) -> bool {
    match value {
        Value::String(s) => {
            if s.chars().count() <= max_chars {
                return false;
            }
            let mut cut: String = s.chars().take(max_chars).collect();
            cut.push_str(TRUNCATION_MARKER);
            *s = cut;
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| truncate_strings(v, max_chars) | acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| truncate_strings(v, max_chars) | acc),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(value: Value) -> ToolOutput {
        ToolOutput::new(value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_nulls_removed_recursively() {
        let out = output(json!({"a": null, "b": {"c": null, "d": 1}, "e": [null, 2]}));
        let clean = sanitize_output("t", None, out, 100).unwrap();
        assert_eq!(Value::Object(clean.result), json!({"b": {"d": 1}, "e": [2]}));
    }

    #[test]
    fn test_long_strings_truncated_with_marker() {
        let out = output(json!({"source": "x".repeat(50), "name": "short"}));
        let clean = sanitize_output("read_script", None, out, 10).unwrap();
        let source = clean.result["source"].as_str().unwrap();
        assert!(source.starts_with("xxxxxxxxxx"));
        assert!(source.ends_with(TRUNCATION_MARKER));
        assert_eq!(clean.result["truncated"], json!(true));
        assert_eq!(clean.result["name"], json!("short"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let out = output(json!({"content": "蜂".repeat(20)}));
        let clean = sanitize_output("read_script", None, out, 5).unwrap();
        assert!(clean.result["content"].as_str().unwrap().starts_with("蜂蜂蜂蜂蜂..."));
    }

    #[test]
    fn test_missing_required_field_downgraded() {
        let out = output(json!({"source": ""}));
        let err = sanitize_output("read_script", Some("source"), out, 100).unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::MissingResource));
        assert!(err.message.contains("source"));

        let out = output(json!({"source": null}));
        assert!(sanitize_output("read_script", Some("source"), out, 100).is_err());
    }
}
