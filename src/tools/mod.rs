//! 工具层：注册表、执行器、弹性层（重试 / 清洗 / 健康度）与内置工具

pub mod executor;
pub mod health;
pub mod project_memory;
pub mod registry;
pub mod resilience;
pub mod sanitize;
pub mod workspace;

pub use executor::{ExecutorConfig, ToolExecutor};
pub use health::{HealthMetrics, HealthReport};
pub use project_memory::{InMemoryKv, KeyValueStore, ProjectMemoryLoadTool, ProjectMemorySaveTool};
pub use registry::{Tool, ToolCategory, ToolOutput, ToolRegistry};
pub use resilience::{classify_failure, target_path, FailureClass, ResilienceConfig, ToolResilience};
pub use sanitize::{sanitize_output, TRUNCATION_MARKER};
pub use workspace::{register_workspace_tools, Instance, InstanceTree};
