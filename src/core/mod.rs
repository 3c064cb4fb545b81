//! 核心编排层：错误与分类、熔断、审批队列、循环状态、会话监管与运行时

pub mod approval;
pub mod builder;
pub mod circuit_breaker;
pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use approval::{
    ApprovalConfig, ApprovalError, ApprovalQueue, ApprovalSnapshot, OperationId, OperationStatus,
    PendingOperation,
};
pub use builder::AgentBuilder;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitGate, CircuitMode, CircuitState};
pub use classifier::{
    categorize_message, ErrorCategory, ErrorClassification, ErrorClassifier, RecoveryStrategy,
    Severity,
};
pub use error::{AgentError, ToolError};
pub use orchestrator::{create_agent, spawn_agent, AgentHandle, Command, TurnRequest};
pub use session_supervisor::{SessionSupervisor, TurnGuard};
pub use state::{BatchState, LoopResult, LoopState, PauseKind, PausedState, ToolCall};
