//! Token 估算
//!
//! 压缩阈值判断只需要粗略估算：文本按 4 字节/token，函数调用按固定成本，
//! 函数返回按序列化后长度/4。

use crate::memory::{Message, Part};

/// 单个 FunctionCall 的固定 token 成本
pub const FUNCTION_CALL_TOKENS: usize = 50;

/// Token 估算器（简单的字节计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate_text(text: &str) -> usize {
        text.len() / 4
    }

    /// 估算单个 Part
    pub fn estimate_part(part: &Part) -> usize {
        match part {
            Part::Text { text } => Self::estimate_text(text),
            Part::FunctionCall { .. } => FUNCTION_CALL_TOKENS,
            Part::FunctionResponse { response, .. } => {
                // Map 序列化不会失败；兜底按 0 计
                serde_json::to_string(response)
                    .map(|s| s.len() / 4)
                    .unwrap_or(0)
            }
        }
    }

    /// 估算单条消息
    pub fn estimate_message(message: &Message) -> usize {
        message.parts.iter().map(Self::estimate_part).sum()
    }

    /// 估算一组消息
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::Args;

    #[test]
    fn test_text_is_len_over_four() {
        assert_eq!(TokenEstimator::estimate_text("abcdefgh"), 2);
        assert_eq!(TokenEstimator::estimate_text(""), 0);
    }

    #[test]
    fn test_function_call_fixed_cost() {
        let msg = Message::model(vec![
            Part::call("read_instance", Args::new()),
            Part::call("read_script", Args::new()),
        ]);
        assert_eq!(TokenEstimator::estimate_message(&msg), 2 * FUNCTION_CALL_TOKENS);
    }

    #[test]
    fn test_function_response_uses_serialized_size() {
        let mut response = Args::new();
        response.insert("content".into(), json!("x".repeat(400)));
        let part = Part::response("read_script", response.clone());
        let serialized = serde_json::to_string(&response).unwrap().len();
        assert_eq!(TokenEstimator::estimate_part(&part), serialized / 4);
    }
}
