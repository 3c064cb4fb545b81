//! 工具弹性层
//!
//! 每次调用最多尝试 max_retries + 1 次（每次受超时约束）：
//! - 网络 / 超时 / 限流类错误按固定退避步长重试；
//! - 「状态过期」类错误（路径不存在、搜索内容不存在）立即返回：写入失败时标记该路径需要重新同步并附重读建议，
//!   读取得到的确定答复（包括「不存在」）视为已完成重读，清除标记；
//! - 其余错误（属性、权限等）立即返回。
//!
//! 所有输出经 sanitize 清洗；滚动健康窗口在错误率过高时给出提示。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::{sleep, timeout};

use crate::core::{categorize_message, ErrorCategory, ToolError};
use crate::memory::Args;
use crate::tools::{sanitize_output, HealthMetrics, HealthReport, Tool, ToolCategory, ToolOutput};

/// 弹性层配置
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    /// 第 n 次重试前的等待；超出长度时沿用最后一项
    pub backoff: Vec<Duration>,
    pub tool_timeout: Duration,
    pub max_output_chars: usize,
    pub health_window: usize,
    pub health_error_threshold: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ],
            tool_timeout: Duration::from_secs(30),
            max_output_chars: 20_000,
            health_window: 20,
            health_error_threshold: 0.3,
        }
    }
}

/// 失败的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 可重试
    Transient,
    /// 调用方记忆的状态已过期，重试前必须重读
    StaleState,
    Permanent,
}

fn transient_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)timed? ?out|network|connection|temporar|unavailable|rate.?limit|\b(429|502|503)\b|reset by peer",
            )
            .ok()
        })
        .as_ref()
}

pub fn classify_failure(error: &ToolError) -> FailureClass {
    let category = match error.category {
        Some(c) => c,
        None => {
            if transient_pattern().is_some_and(|re| re.is_match(&error.message)) {
                return FailureClass::Transient;
            }
            categorize_message(&error.message)
        }
    };
    match category {
        ErrorCategory::RateLimited => FailureClass::Transient,
        ErrorCategory::MissingResource | ErrorCategory::SearchFailed => FailureClass::StaleState,
        _ => FailureClass::Permanent,
    }
}

/// 参数中的目标路径
pub fn target_path(args: &Args) -> Option<&str> {
    args.get("path").and_then(|v| v.as_str())
}

/// 工具弹性层：重试、过期状态标记、输出清洗、健康度
#[derive(Debug)]
pub struct ToolResilience {
    config: ResilienceConfig,
    health: HealthMetrics,
    stale_paths: HashSet<String>,
}

impl ToolResilience {
    pub fn new(config: ResilienceConfig) -> Self {
        let health = HealthMetrics::new(config.health_window, config.health_error_threshold);
        Self {
            config,
            health,
            stale_paths: HashSet::new(),
        }
    }

    pub async fn execute_resilient(
        &mut self,
        tool: &dyn Tool,
        args: &Args,
    ) -> Result<ToolOutput, ToolError> {
        let name = tool.name().to_string();
        let mut attempt: u32 = 0;
        loop {
            let outcome = match timeout(self.config.tool_timeout, tool.execute(args)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::timeout(&name, self.config.tool_timeout)),
            };

            let err = match outcome {
                Ok(output) => {
                    return match sanitize_output(
                        &name,
                        tool.required_output_field(),
                        output,
                        self.config.max_output_chars,
                    ) {
                        Ok(mut output) => {
                            output.recovered = attempt > 0;
                            if output.recovered {
                                tracing::info!(tool = %name, attempt, "tool recovered after retry");
                            }
                            self.health.record(&name, true, output.recovered);
                            if tool.category() == ToolCategory::Read {
                                if let Some(path) = target_path(args) {
                                    self.stale_paths.remove(path);
                                }
                            }
                            Ok(output)
                        }
                        Err(e) => {
                            self.health.record(&name, false, false);
                            Err(e)
                        }
                    };
                }
                Err(e) => e,
            };

            match classify_failure(&err) {
                FailureClass::Transient if attempt < self.config.max_retries => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        tool = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient tool failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                FailureClass::StaleState if tool.category() == ToolCategory::Read => {
                    self.health.record(&name, false, false);
                    if let Some(path) = target_path(args) {
                        self.stale_paths.remove(path);
                    }
                    return Err(err);
                }
                FailureClass::StaleState => {
                    self.health.record(&name, false, false);
                    let hint = match target_path(args) {
                        Some(path) => {
                            self.stale_paths.insert(path.to_string());
                            format!("state out of sync: re-read `{path}` before retrying")
                        }
                        None => "state out of sync: re-read the target before retrying".to_string(),
                    };
                    return Err(err.with_hint(hint));
                }
                _ => {
                    self.health.record(&name, false, false);
                    return Err(err);
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let steps = &self.config.backoff;
        steps
            .get(attempt as usize)
            .or_else(|| steps.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// 该路径是否需要先重读
    pub fn is_stale(&self, path: &str) -> bool {
        self.stale_paths.contains(path)
    }

    pub fn stale_paths(&self) -> impl Iterator<Item = &String> {
        self.stale_paths.iter()
    }

    pub fn health_warning(&self) -> Option<String> {
        self.health.warning()
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// 新任务：清空过期路径标记（健康度为跨任务的累计观测，保留）
    pub fn reset_for_task(&mut self) {
        self.stale_paths.clear();
    }
}

impl Default for ToolResilience {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}
