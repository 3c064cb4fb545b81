//! 会话监管：单飞（同一会话同时只允许一轮）与关闭信号
//!
//! try_begin 成功时返回 TurnGuard，guard drop 时释放；持有 CancellationToken 供后台 actor 感知关闭。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    busy: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

/// 一轮执行期间持有；drop 即释放
#[derive(Debug)]
pub struct TurnGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// 已有一轮在执行时返回 TurnInFlight
    pub fn try_begin(&self) -> Result<TurnGuard, AgentError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::TurnInFlight)?;
        Ok(TurnGuard {
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
