//! 审批队列
//!
//! 写操作先入队等待人工确认：Pending 只会迁移一次到 Approved / Rejected / Expired，不会回到 Pending。
//! 超过 TTL 的待审批操作在审批或清扫时过期；容量满时先淘汰最旧的已决操作，实在没有才淘汰最旧的待审批操作。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Args;

/// 操作 ID（单调递增）
pub type OperationId = u64;

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// 待审批操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    /// 操作类型（即工具名）
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Args,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    /// 发起该操作的任务
    pub task_id: Option<String>,
}

impl PendingOperation {
    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("operation {0} not found")]
    NotFound(OperationId),

    #[error("operation {id} already resolved as {status:?}")]
    AlreadyResolved {
        id: OperationId,
        status: OperationStatus,
    },

    #[error("operation {0} expired before it was approved")]
    Expired(OperationId),
}

/// 队列配置
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub operation_ttl: Duration,
    pub max_operations: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            operation_ttl: Duration::from_secs(600),
            max_operations: 50,
        }
    }
}

/// 持久化形态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSnapshot {
    pub next_id: OperationId,
    pub operations: Vec<PendingOperation>,
}

/// 审批队列（按 id 有序，id 越小越旧）
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    config: ApprovalConfig,
    operations: BTreeMap<OperationId, PendingOperation>,
    next_id: OperationId,
}

impl ApprovalQueue {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            operations: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn restore(config: ApprovalConfig, snapshot: ApprovalSnapshot) -> Self {
        let operations = snapshot
            .operations
            .into_iter()
            .map(|op| (op.id, op))
            .collect::<BTreeMap<_, _>>();
        let next_id = operations
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1)
            .max(snapshot.next_id);
        Self {
            config,
            operations,
            next_id,
        }
    }

    pub fn snapshot(&self) -> ApprovalSnapshot {
        ApprovalSnapshot {
            next_id: self.next_id,
            operations: self.operations.values().cloned().collect(),
        }
    }

    /// 入队并返回新 ID
    pub fn queue(&mut self, kind: &str, data: Args, task_id: Option<&str>) -> OperationId {
        self.expire_stale();
        while self.operations.len() >= self.config.max_operations.max(1) {
            self.evict_one();
        }
        let id = self.next_id;
        self.next_id += 1;
        self.operations.insert(
            id,
            PendingOperation {
                id,
                kind: kind.to_string(),
                data,
                status: OperationStatus::Pending,
                created_at: Utc::now(),
                task_id: task_id.map(str::to_string),
            },
        );
        tracing::debug!(id, kind, "operation queued for approval");
        id
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.operations.get(&id)
    }

    /// 批准；已过期则标记 Expired 并返回错误
    pub fn approve(&mut self, id: OperationId) -> Result<PendingOperation, ApprovalError> {
        self.resolve(id, OperationStatus::Approved)
    }

    pub fn reject(&mut self, id: OperationId) -> Result<PendingOperation, ApprovalError> {
        self.resolve(id, OperationStatus::Rejected)
    }

    pub fn all(&self) -> Vec<PendingOperation> {
        self.operations.values().cloned().collect()
    }

    /// 仍待审批的操作（按创建顺序）
    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.operations.values().filter(|op| op.is_pending())
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 清扫超过 TTL 的待审批操作，返回过期数量
    pub fn expire_stale(&mut self) -> usize {
        let now = Utc::now();
        let ttl = self.config.operation_ttl;
        let mut expired = 0;
        for op in self.operations.values_mut() {
            if op.is_pending() && is_older_than(op.created_at, now, ttl) {
                op.status = OperationStatus::Expired;
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "pending operations expired");
        }
        expired
    }

    fn resolve(
        &mut self,
        id: OperationId,
        status: OperationStatus,
    ) -> Result<PendingOperation, ApprovalError> {
        let ttl = self.config.operation_ttl;
        let op = self
            .operations
            .get_mut(&id)
            .ok_or(ApprovalError::NotFound(id))?;
        if !op.is_pending() {
            return Err(ApprovalError::AlreadyResolved {
                id,
                status: op.status,
            });
        }
        if status == OperationStatus::Approved && is_older_than(op.created_at, Utc::now(), ttl) {
            op.status = OperationStatus::Expired;
            return Err(ApprovalError::Expired(id));
        }
        op.status = status;
        tracing::info!(id, ?status, kind = %op.kind, "operation resolved");
        Ok(op.clone())
    }

    /// 淘汰一条：优先最旧的已决操作，其次最旧的待审批操作
    fn evict_one(&mut self) {
        let victim = self
            .operations
            .values()
            .find(|op| !op.is_pending())
            .map(|op| op.id);
        let victim = match victim {
            Some(id) => id,
            None => match self.operations.keys().next() {
                Some(&id) => {
                    tracing::warn!(id, "approval queue full, evicting oldest pending operation");
                    id
                }
                None => return,
            },
        };
        self.operations.remove(&victim);
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new(ApprovalConfig::default())
    }
}

fn is_older_than(created_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    (now - created_at)
        .to_std()
        .map(|age| age > ttl)
        .unwrap_or(false)
}
