//! 工具熔断器
//!
//! 连续失败达到阈值后熔断（Open），冷却期内拒绝一切工具调用；冷却结束进入 HalfOpen 放行一次试探，
//! 成功则恢复 Closed，失败则重新 Open。新任务开始时整体复位，避免继承上一个任务接近熔断的计数。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 熔断器模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitMode {
    /// 正常放行
    Closed,
    /// 冷却结束，放行试探调用
    HalfOpen,
    /// 熔断中，拒绝调用
    Open,
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// 成功时是否清零连续失败计数
    pub reset_on_success: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            reset_on_success: true,
        }
    }
}

/// 可持久化的熔断状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub mode: CircuitMode,
    pub consecutive_failures: u32,
    /// 当前任务内的失败总数
    pub task_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            mode: CircuitMode::Closed,
            consecutive_failures: 0,
            task_failures: 0,
            last_failure_at: None,
        }
    }
}

/// 调用前检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitGate {
    Allowed,
    /// HalfOpen 下的试探调用
    Probe,
    /// 熔断中；retry_in 为剩余冷却时间
    Blocked { retry_in: Duration },
}

/// 熔断器
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::default(),
        }
    }

    pub fn with_state(config: CircuitConfig, state: CircuitState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn mode(&self) -> CircuitMode {
        self.state.mode
    }

    /// 工具调用前的硬闸门；Open 且冷却结束时转为 HalfOpen
    pub fn before_tool_execution(&mut self) -> CircuitGate {
        match self.state.mode {
            CircuitMode::Closed => CircuitGate::Allowed,
            CircuitMode::HalfOpen => CircuitGate::Probe,
            CircuitMode::Open => {
                let remaining = self.remaining_cooldown();
                if remaining.is_zero() {
                    tracing::info!("circuit half-open, allowing probe call");
                    self.state.mode = CircuitMode::HalfOpen;
                    CircuitGate::Probe
                } else {
                    CircuitGate::Blocked {
                        retry_in: remaining,
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state.mode == CircuitMode::HalfOpen {
            tracing::info!("probe succeeded, circuit closed");
            self.state.mode = CircuitMode::Closed;
            self.state.consecutive_failures = 0;
        } else if self.config.reset_on_success {
            self.state.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.state.consecutive_failures += 1;
        self.state.task_failures += 1;
        self.state.last_failure_at = Some(Utc::now());
        match self.state.mode {
            CircuitMode::HalfOpen => {
                tracing::warn!("probe failed, circuit re-opened");
                self.state.mode = CircuitMode::Open;
            }
            CircuitMode::Closed
                if self.state.consecutive_failures >= self.config.failure_threshold =>
            {
                tracing::warn!(
                    failures = self.state.consecutive_failures,
                    "consecutive tool failures reached threshold, circuit opened"
                );
                self.state.mode = CircuitMode::Open;
            }
            _ => {}
        }
    }

    /// 新任务：恢复 Closed 并清零计数
    pub fn reset_for_task(&mut self) {
        self.state = CircuitState::default();
    }

    fn remaining_cooldown(&self) -> Duration {
        let Some(last) = self.state.last_failure_at else {
            return Duration::ZERO;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        self.config.cooldown.saturating_sub(elapsed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            reset_on_success: true,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.before_tool_execution(), CircuitGate::Allowed);
        cb.record_failure();
        assert_eq!(cb.mode(), CircuitMode::Open);
        assert!(matches!(cb.before_tool_execution(), CircuitGate::Blocked { .. }));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.mode(), CircuitMode::Closed);
        assert_eq!(cb.state().consecutive_failures, 1);
        assert_eq!(cb.state().task_failures, 3);
    }

    #[test]
    fn test_half_open_then_closed_after_cooldown() {
        let mut cb = breaker(2, 20);
        cb.record_failure();
        cb.record_failure();
        assert!(matches!(cb.before_tool_execution(), CircuitGate::Blocked { .. }));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.before_tool_execution(), CircuitGate::Probe);
        assert_eq!(cb.mode(), CircuitMode::HalfOpen);
        cb.record_success();
        assert_eq!(cb.mode(), CircuitMode::Closed);
        assert_eq!(cb.before_tool_execution(), CircuitGate::Allowed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(1, 20);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.before_tool_execution(), CircuitGate::Probe);
        cb.record_failure();
        assert_eq!(cb.mode(), CircuitMode::Open);
        assert!(matches!(cb.before_tool_execution(), CircuitGate::Blocked { .. }));
    }

    #[test]
    fn test_reset_for_task() {
        let mut cb = breaker(2, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.mode(), CircuitMode::Open);
        cb.reset_for_task();
        assert_eq!(cb.state(), &CircuitState::default());
        assert_eq!(cb.before_tool_execution(), CircuitGate::Allowed);
    }
}
