//! 工具执行器
//!
//! 持有 ToolRegistry 与弹性层，execute(tool_name, args) 按工具类别路由：
//! 读 / 项目记忆工具立即经弹性层执行；写工具先校验前置条件再入审批队列，批准后由 apply 落地。
//! 同一「工具名 + 参数」在时间窗内反复失败时直接拒绝，不再调用工具；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::core::{ApprovalQueue, ErrorCategory, PendingOperation, ToolError};
use crate::memory::Args;
use crate::tools::{Tool, ToolCategory, ToolOutput, ToolRegistry, ToolResilience};

/// 参数预览 / 调用身份的最大长度
const IDENTITY_MAX_CHARS: usize = 200;

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 同一调用在窗口内失败多少次后拒绝
    pub repeat_failure_limit: u32,
    pub repeat_window: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            repeat_failure_limit: 3,
            repeat_window: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_at: Instant,
}

/// 工具执行器：路由、重复失败拦截、审计
pub struct ToolExecutor {
    registry: ToolRegistry,
    resilience: ToolResilience,
    config: ExecutorConfig,
    failures: HashMap<String, FailureRecord>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, resilience: ToolResilience, config: ExecutorConfig) -> Self {
        Self {
            registry,
            resilience,
            config,
            failures: HashMap::new(),
        }
    }

    /// 执行指定工具；写工具只入队，返回 pending 结果
    pub async fn execute(
        &mut self,
        tool_name: &str,
        args: &Args,
        approvals: &mut ApprovalQueue,
        task_id: Option<&str>,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let identity = call_identity(tool_name, args);

        if let Some(err) = self.repeated_failure(&identity, tool_name) {
            audit(tool_name, "short_circuit", start, &identity);
            return Err(err);
        }

        let tool = self.registry.get(tool_name).ok_or_else(|| {
            ToolError::new(
                ErrorCategory::MissingResource,
                format!("unknown tool `{tool_name}`"),
            )
        })?;

        let result = match tool.category() {
            ToolCategory::Read | ToolCategory::Project => {
                self.resilience.execute_resilient(tool.as_ref(), args).await
            }
            ToolCategory::Write => queue_write(tool.as_ref(), args, approvals, task_id).await,
        };

        let outcome = match &result {
            Ok(out) if out.pending.is_some() => "queued",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        audit(tool_name, outcome, start, &identity);
        self.record_outcome(identity, result.is_ok());
        result
    }

    /// 执行已批准的操作
    pub async fn apply(&mut self, op: &PendingOperation) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let identity = call_identity(&op.kind, &op.data);
        let tool = self.registry.get(&op.kind).ok_or_else(|| {
            ToolError::new(
                ErrorCategory::MissingResource,
                format!("unknown tool `{}`", op.kind),
            )
        })?;
        let result = self.resilience.execute_resilient(tool.as_ref(), &op.data).await;
        audit(
            &op.kind,
            if result.is_ok() { "applied" } else { "error" },
            start,
            &identity,
        );
        self.record_outcome(identity, result.is_ok());
        result
    }

    fn repeated_failure(&mut self, identity: &str, tool_name: &str) -> Option<ToolError> {
        let record = *self.failures.get(identity)?;
        if record.last_at.elapsed() > self.config.repeat_window {
            self.failures.remove(identity);
            return None;
        }
        (record.count >= self.config.repeat_failure_limit).then(|| {
            tracing::warn!(
                tool = tool_name,
                failures = record.count,
                "repeated failure short-circuited"
            );
            ToolError::opaque(format!(
                "`{tool_name}` has failed {} times with identical arguments; stop repeating this call and change the arguments or approach",
                record.count
            ))
        })
    }

    fn record_outcome(&mut self, identity: String, ok: bool) {
        if ok {
            self.failures.remove(&identity);
            return;
        }
        let now = Instant::now();
        let window = self.config.repeat_window;
        self.failures
            .entry(identity)
            .and_modify(|r| {
                if r.last_at.elapsed() > window {
                    r.count = 0;
                }
                r.count += 1;
                r.last_at = now;
            })
            .or_insert(FailureRecord {
                count: 1,
                last_at: now,
            });
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn resilience(&self) -> &ToolResilience {
        &self.resilience
    }

    /// 新任务：清空重复失败计数与过期路径
    pub fn reset_for_task(&mut self) {
        self.failures.clear();
        self.resilience.reset_for_task();
    }
}

async fn queue_write(
    tool: &dyn Tool,
    args: &Args,
    approvals: &mut ApprovalQueue,
    task_id: Option<&str>,
) -> Result<ToolOutput, ToolError> {
    let queued: Vec<PendingOperation> = approvals
        .pending()
        .filter(|op| op.task_id.as_deref() == task_id)
        .cloned()
        .collect();
    tool.check_preconditions(args, &queued).await?;

    let id = approvals.queue(tool.name(), args.clone(), task_id);
    let mut result = Args::new();
    result.insert("status".into(), json!("queued"));
    result.insert("operation".into(), json!(tool.name()));
    Ok(ToolOutput::pending(id, result))
}

/// 调用身份：工具名 + 参数的规范 JSON（serde_json::Map 按键排序）
fn call_identity(tool_name: &str, args: &Args) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let canonical: String = canonical.chars().take(IDENTITY_MAX_CHARS).collect();
    format!("{tool_name}:{canonical}")
}

fn audit(tool_name: &str, outcome: &str, start: Instant, identity: &str) {
    let ok = matches!(outcome, "ok" | "queued" | "applied");
    let audit = json!({
        "event": "tool_audit",
        "tool": tool_name,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": identity,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}
