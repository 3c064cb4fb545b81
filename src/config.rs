//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `APIARY__*` 覆盖（双下划线表示嵌套，如 `APIARY__AGENT__MAX_ITERATIONS=30`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{ApprovalConfig, CircuitConfig};
use crate::memory::CompressionConfig;
use crate::react::SessionConfig;
use crate::tools::{ExecutorConfig, ResilienceConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub resilience: ResilienceSection,
    pub executor: ExecutorSection,
    pub circuit: CircuitSection,
    pub approval: ApprovalSection,
    pub compression: CompressionSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话快照目录；未设置时不持久化
    pub session_dir: Option<PathBuf>,
}

/// [agent] 段：迭代上限与需要暂停的工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    pub max_blocked_batches: u32,
    pub dangerous_operations: Vec<String>,
    pub feedback_operations: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        let mut dangerous: Vec<String> = defaults.dangerous_operations.into_iter().collect();
        dangerous.sort();
        Self {
            max_iterations: defaults.max_iterations,
            max_blocked_batches: defaults.max_blocked_batches,
            dangerous_operations: dangerous,
            feedback_operations: defaults.feedback_operations.into_iter().collect(),
        }
    }
}

/// [resilience] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub max_retries: u32,
    pub retry_backoff_ms: Vec<u64>,
    pub tool_timeout_secs: u64,
    pub max_output_chars: usize,
    pub health_window: usize,
    pub health_error_threshold: f64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: vec![100, 500, 1000],
            tool_timeout_secs: 30,
            max_output_chars: 20_000,
            health_window: 20,
            health_error_threshold: 0.3,
        }
    }
}

/// [executor] 段：相同调用反复失败的拦截
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub repeat_failure_limit: u32,
    pub repeat_window_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            repeat_failure_limit: 3,
            repeat_window_secs: 30,
        }
    }
}

/// [circuit] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub reset_on_success: bool,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            reset_on_success: true,
        }
    }
}

/// [approval] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub operation_ttl_secs: u64,
    pub max_pending_operations: usize,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            operation_ttl_secs: 600,
            max_pending_operations: 50,
        }
    }
}

/// [compression] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub token_threshold: usize,
    pub messages_to_preserve: usize,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            token_threshold: 24_000,
            messages_to_preserve: 10,
        }
    }
}

impl AppConfig {
    /// 转为各组件的强类型配置
    pub fn session_config(&self) -> SessionConfig {
        let backoff = if self.resilience.retry_backoff_ms.is_empty() {
            ResilienceConfig::default().backoff
        } else {
            self.resilience
                .retry_backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect()
        };
        SessionConfig {
            max_iterations: self.agent.max_iterations,
            max_blocked_batches: self.agent.max_blocked_batches.max(1),
            dangerous_operations: self.agent.dangerous_operations.iter().cloned().collect(),
            feedback_operations: self.agent.feedback_operations.iter().cloned().collect(),
            compression: CompressionConfig {
                token_threshold: self.compression.token_threshold,
                messages_to_preserve: self.compression.messages_to_preserve,
            },
            circuit: CircuitConfig {
                failure_threshold: self.circuit.failure_threshold.max(1),
                cooldown: Duration::from_secs(self.circuit.cooldown_secs),
                reset_on_success: self.circuit.reset_on_success,
            },
            approval: ApprovalConfig {
                operation_ttl: Duration::from_secs(self.approval.operation_ttl_secs),
                max_operations: self.approval.max_pending_operations,
            },
            resilience: ResilienceConfig {
                max_retries: self.resilience.max_retries,
                backoff,
                tool_timeout: Duration::from_secs(self.resilience.tool_timeout_secs),
                max_output_chars: self.resilience.max_output_chars,
                health_window: self.resilience.health_window,
                health_error_threshold: self.resilience.health_error_threshold,
            },
            executor: ExecutorConfig {
                repeat_failure_limit: self.executor.repeat_failure_limit,
                repeat_window: Duration::from_secs(self.executor.repeat_window_secs),
            },
        }
    }
}

/// 从 config 目录加载配置，环境变量 APIARY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 APIARY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("APIARY")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.dangerous_operations")
            .with_list_parse_key("agent.feedback_operations")
            .with_list_parse_key("resilience.retry_backoff_ms")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
