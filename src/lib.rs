//! Apiary - Rust 智能体编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、熔断、审批队列、循环状态、会话监管与运行时
//! - **llm**: 模型客户端与摘要函数抽象（含 Mock / 脚本化实现）
//! - **memory**: 对话历史与压缩、token 估算、会话快照持久化
//! - **observability**: 日志初始化
//! - **react**: Agentic 主循环、调用解析与校验、过程事件
//! - **tools**: 工具注册表、执行器、弹性层与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, AgentHandle, LoopResult};
pub use crate::react::{AgentSession, SessionConfig};
