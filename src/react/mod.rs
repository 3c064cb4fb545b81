//! 认知层：模型输出解析、调用校验、Agentic 主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::LoopEvent;
pub use loop_::{interpret_feedback, AgentSession, SessionConfig};
pub use planner::{split_response, validate_call};
