//! Agentic 主循环
//!
//! 每轮迭代：压缩历史 -> 调用模型 -> 拆出思考文本与工具调用 -> 按序执行整个批次 -> 下一轮；
//! 无工具调用即完成。写操作命中危险集合时暂停等待审批，反馈类工具暂停等待用户反馈，
//! 暂停快照（批次、游标、已有响应）可序列化，恢复只依赖快照与人的决定。
//! 工具失败回灌给模型；模型失败直接结束本轮。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::core::{
    ApprovalConfig, ApprovalError, ApprovalQueue, BatchState, CircuitBreaker, CircuitConfig,
    CircuitGate, ErrorCategory, ErrorClassifier, LoopResult, LoopState, OperationId, PauseKind,
    PausedState, ToolCall, ToolError,
};
use crate::llm::{LlmClient, Summarizer};
use crate::memory::{
    Args, CompressionConfig, CompressionOutcome, ConversationHistory, Message, Part, Role,
    SessionSnapshot,
};
use crate::react::{split_response, validate_call, LoopEvent};
use crate::tools::{
    ExecutorConfig, HealthReport, ResilienceConfig, ToolExecutor, ToolRegistry, ToolResilience,
};

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 会话配置（由 AppConfig::session_config 生成）
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_iterations: u32,
    /// 本轮连续多少个批次被熔断拦截后放弃
    pub max_blocked_batches: u32,
    /// 需要人工审批的写工具
    pub dangerous_operations: HashSet<String>,
    /// 返回 feedback_request 时暂停等待用户反馈的工具
    pub feedback_operations: HashSet<String>,
    pub compression: CompressionConfig,
    pub circuit: CircuitConfig,
    pub approval: ApprovalConfig,
    pub resilience: ResilienceConfig,
    pub executor: ExecutorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_blocked_batches: 3,
            dangerous_operations: [
                "create_instance",
                "set_property",
                "edit_script",
                "delete_instance",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            feedback_operations: ["request_user_verification"]
                .into_iter()
                .map(String::from)
                .collect(),
            compression: CompressionConfig::default(),
            circuit: CircuitConfig::default(),
            approval: ApprovalConfig::default(),
            resilience: ResilienceConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// 单个调用的处理结果
enum CallStep {
    Response(Part),
    AwaitApproval { operation_id: OperationId },
    AwaitFeedback { request: String },
}

/// 一个会话的全部状态：历史、审批队列、熔断器、分类器、执行器与循环状态
pub struct AgentSession {
    conversation_id: String,
    llm: Arc<dyn LlmClient>,
    summarizer: Option<Arc<dyn Summarizer>>,
    executor: ToolExecutor,
    history: ConversationHistory,
    approvals: ApprovalQueue,
    circuit: CircuitBreaker,
    classifier: ErrorClassifier,
    state: LoopState,
    config: SessionConfig,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl AgentSession {
    pub fn new(llm: Arc<dyn LlmClient>, registry: ToolRegistry, config: SessionConfig) -> Self {
        let executor = ToolExecutor::new(
            registry,
            ToolResilience::new(config.resilience.clone()),
            config.executor.clone(),
        );
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            llm,
            summarizer: None,
            executor,
            history: ConversationHistory::new(config.compression.clone()),
            approvals: ApprovalQueue::new(config.approval.clone()),
            circuit: CircuitBreaker::new(config.circuit.clone()),
            classifier: ErrorClassifier::new(),
            state: LoopState::default(),
            config,
            event_tx: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = id.into();
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn health_report(&self) -> HealthReport {
        self.executor.resilience().health_report()
    }

    /// 新任务：清空历史与暂停，重置熔断 / 分类器的任务作用域
    pub async fn start(&mut self, user_message: &str) -> LoopResult {
        self.history.clear();
        self.state = LoopState::default();
        self.begin_task();
        tracing::info!(task_id = %self.state.task_id, "task started");
        self.history.append(Message::user(user_message));
        self.run().await
    }

    /// 在已有历史上继续；若仍有暂停，先关闭该批次并保留为过期快照
    pub async fn continue_with(&mut self, user_message: &str) -> LoopResult {
        self.close_paused_batch();
        self.state.iteration = 0;
        self.state.accumulated_text.clear();
        self.state.blocked_batches = 0;
        self.begin_task();
        tracing::info!(task_id = %self.state.task_id, "task continued");
        self.history.append(Message::user(user_message));
        self.run().await
    }

    /// 审批决定后继续被暂停的批次
    pub async fn resume_with_approval(&mut self, approved: bool) -> LoopResult {
        let iterations = self.state.iteration;
        let operation_id = match &self.state.paused {
            Some(PausedState {
                kind: PauseKind::Approval { operation_id },
                ..
            }) => *operation_id,
            _ => return LoopResult::failed("no operation awaiting approval", iterations),
        };
        let Some(paused) = self.state.paused.take() else {
            return LoopResult::failed("no operation awaiting approval", iterations);
        };
        if paused.task_id != self.state.task_id {
            tracing::warn!(operation_id, "approval for a finished task ignored");
            return LoopResult::failed(
                format!("operation {operation_id} expired: its task is no longer active"),
                iterations,
            );
        }

        let batch = paused.batch;
        let Some(call) = batch.calls.get(batch.cursor).cloned() else {
            return LoopResult::failed("paused batch is corrupt", iterations);
        };
        let part = if approved {
            tracing::info!(operation_id, tool = %call.name, "operation approved");
            self.apply_operation(operation_id, &call.name).await
        } else {
            tracing::info!(operation_id, tool = %call.name, "operation denied");
            if let Err(e) = self.approvals.reject(operation_id) {
                tracing::warn!(operation_id, error = %e, "reject failed");
            }
            let err = ToolError::new(
                ErrorCategory::UserDenied,
                format!("the user denied `{}`; do not retry it without asking", call.name),
            );
            self.error_response(&call.name, err)
        };
        self.resume_batch(batch, part).await
    }

    /// 用户反馈后继续被暂停的批次
    pub async fn resume_with_feedback(&mut self, feedback: &str) -> LoopResult {
        let iterations = self.state.iteration;
        let request = match &self.state.paused {
            Some(PausedState {
                kind: PauseKind::Feedback { request },
                ..
            }) => request.clone(),
            _ => return LoopResult::failed("no request awaiting feedback", iterations),
        };
        let Some(paused) = self.state.paused.take() else {
            return LoopResult::failed("no request awaiting feedback", iterations);
        };
        if paused.task_id != self.state.task_id {
            return LoopResult::failed(
                "feedback request expired: its task is no longer active",
                iterations,
            );
        }

        let batch = paused.batch;
        let Some(call) = batch.calls.get(batch.cursor).cloned() else {
            return LoopResult::failed("paused batch is corrupt", iterations);
        };
        let mut response = Args::new();
        response.insert("question".into(), json!(request));
        response.insert("user_feedback".into(), json!(feedback));
        response.insert("interpretation".into(), json!(interpret_feedback(feedback)));
        self.resume_batch(batch, Part::response(call.name, response)).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            history: self.history.messages().to_vec(),
            approvals: self.approvals.snapshot(),
            circuit: self.circuit.state().clone(),
            loop_state: self.state.clone(),
            saved_at: Utc::now(),
        }
    }

    /// 从快照恢复（工具注册与配置沿用当前会话）
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        self.conversation_id = snapshot.conversation_id;
        self.history =
            ConversationHistory::from_messages(snapshot.history, self.config.compression.clone());
        self.approvals = ApprovalQueue::restore(self.config.approval.clone(), snapshot.approvals);
        self.circuit = CircuitBreaker::with_state(self.config.circuit.clone(), snapshot.circuit);
        self.state = snapshot.loop_state;
        self.classifier = ErrorClassifier::new();
    }

    fn begin_task(&mut self) {
        self.state.task_id = Uuid::new_v4().to_string();
        self.circuit.reset_for_task();
        self.classifier.reset_for_task();
        self.executor.reset_for_task();
    }

    /// 以 abandoned 响应补齐暂停批次，保持调用 / 响应配对
    fn close_paused_batch(&mut self) {
        let Some(paused) = &self.state.paused else {
            return;
        };
        if paused.task_id != self.state.task_id {
            return;
        }
        let mut batch = paused.batch.clone();
        batch.responses.truncate(batch.cursor);
        for call in &batch.calls[batch.cursor.min(batch.calls.len())..] {
            batch.responses.push(status_response(
                &call.name,
                "abandoned",
                "the user moved on before this call was resolved",
            ));
        }
        let abandoned = batch.calls.len() - batch.cursor.min(batch.calls.len());
        tracing::info!(abandoned, "paused batch closed");
        self.history.append(Message::tool(batch.responses));
    }

    async fn resume_batch(&mut self, mut batch: BatchState, part: Part) -> LoopResult {
        match batch.responses.get_mut(batch.cursor) {
            Some(slot) => *slot = part,
            None => batch.responses.push(part),
        }
        batch.cursor += 1;
        match self.process_batch(batch).await {
            Some(result) => result,
            None => self.run().await,
        }
    }

    async fn run(&mut self) -> LoopResult {
        loop {
            self.state.iteration += 1;
            let iteration = self.state.iteration;
            let max = self.config.max_iterations;
            if iteration > max {
                tracing::warn!(max, "maximum iterations exceeded");
                return self.fail(format!("exceeded maximum iterations ({max})"), None);
            }
            self.emit(LoopEvent::IterationStarted {
                iteration,
                max_iterations: max,
            });

            let outcome = self
                .history
                .compress_if_needed(self.summarizer.as_deref())
                .await;
            if outcome != CompressionOutcome::NotNeeded {
                self.emit(LoopEvent::Compressed { outcome });
            }

            let reply = match self.llm.invoke(self.history.messages()).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(error = %e, iteration, "model call failed");
                    return self.fail(e.to_string(), None);
                }
            };
            let (thinking, calls) = split_response(&reply);
            self.history.append(Message {
                role: Role::Model,
                parts: reply.parts,
            });
            if !thinking.is_empty() {
                self.state.push_text(&thinking);
                self.emit(LoopEvent::Thinking { text: thinking });
            }

            if calls.is_empty() {
                tracing::info!(iteration, "turn completed");
                return LoopResult::Completed {
                    text: self.state.accumulated_text.clone(),
                    iterations: iteration,
                };
            }

            tracing::debug!(iteration, calls = calls.len(), "executing batch");
            let batch = BatchState {
                calls,
                cursor: 0,
                responses: Vec::new(),
            };
            if let Some(result) = self.process_batch(batch).await {
                return result;
            }
        }
    }

    /// 从 batch.cursor 开始按序处理；返回 None 表示批次结束、进入下一轮迭代
    async fn process_batch(&mut self, mut batch: BatchState) -> Option<LoopResult> {
        while batch.cursor < batch.calls.len() {
            let call = batch.calls[batch.cursor].clone();

            if let CircuitGate::Blocked { retry_in } = self.circuit.before_tool_execution() {
                return self.close_blocked_batch(batch, &call, retry_in.as_millis() as u64);
            }

            match self.execute_call(&call).await {
                CallStep::Response(part) => batch.responses.push(part),
                CallStep::AwaitApproval { operation_id } => {
                    batch.responses.push(status_response(
                        &call.name,
                        "awaiting_approval",
                        "waiting for the user to approve this operation",
                    ));
                    self.state.paused = Some(PausedState {
                        kind: PauseKind::Approval { operation_id },
                        batch,
                        task_id: self.state.task_id.clone(),
                    });
                    tracing::info!(operation_id, tool = %call.name, "paused for approval");
                    self.emit(LoopEvent::AwaitingApproval {
                        operation_id,
                        tool: call.name.clone(),
                    });
                    return Some(LoopResult::AwaitingApproval {
                        operation_id,
                        tool_name: call.name,
                        data: call.args,
                        iterations: self.state.iteration,
                    });
                }
                CallStep::AwaitFeedback { request } => {
                    batch.responses.push(status_response(
                        &call.name,
                        "awaiting_feedback",
                        "waiting for the user's feedback",
                    ));
                    self.state.paused = Some(PausedState {
                        kind: PauseKind::Feedback {
                            request: request.clone(),
                        },
                        batch,
                        task_id: self.state.task_id.clone(),
                    });
                    tracing::info!(tool = %call.name, "paused for feedback");
                    self.emit(LoopEvent::AwaitingFeedback {
                        tool: call.name.clone(),
                        request: request.clone(),
                    });
                    return Some(LoopResult::AwaitingFeedback {
                        tool_name: call.name,
                        request,
                        iterations: self.state.iteration,
                    });
                }
            }
            batch.cursor += 1;
        }

        self.state.blocked_batches = 0;
        self.history.append(Message::tool(batch.responses));
        debug_assert!(self.history.pairing_is_consistent());
        None
    }

    /// 熔断拦截：当前调用给错误响应，其余调用给 skipped，批次照常落入历史
    fn close_blocked_batch(
        &mut self,
        mut batch: BatchState,
        call: &ToolCall,
        retry_in_ms: u64,
    ) -> Option<LoopResult> {
        tracing::warn!(tool = %call.name, retry_in_ms, "tool call blocked by open circuit");
        self.emit(LoopEvent::CircuitBlocked {
            tool: call.name.clone(),
            retry_in_ms,
        });
        let mut response = Args::new();
        response.insert(
            "error".into(),
            json!(format!(
                "circuit breaker open after repeated tool failures; tool execution paused for {}s",
                retry_in_ms.div_ceil(1000)
            )),
        );
        response.insert("circuit_open".into(), json!(true));
        response.insert(
            "suggestion".into(),
            json!("Stop calling tools, explain what failed and ask the user how to proceed."),
        );
        batch.responses.push(Part::response(call.name.clone(), response));
        for skipped in &batch.calls[batch.cursor + 1..] {
            batch.responses.push(status_response(
                &skipped.name,
                "skipped",
                "not executed because the circuit breaker is open",
            ));
        }
        self.history.append(Message::tool(batch.responses));

        self.state.blocked_batches += 1;
        if self.state.blocked_batches >= self.config.max_blocked_batches {
            return Some(self.fail(
                "circuit breaker engaged: tool calls kept failing and recovery was exhausted",
                Some("Check the environment, then start a new task.".to_string()),
            ));
        }
        None
    }

    async fn execute_call(&mut self, call: &ToolCall) -> CallStep {
        if let Err(err) =
            validate_call(call, self.executor.registry(), self.executor.resilience())
        {
            tracing::debug!(tool = %call.name, error = %err, "call rejected before execution");
            return CallStep::Response(self.error_response(&call.name, err));
        }

        self.emit(LoopEvent::ToolCall {
            tool: call.name.clone(),
            args: call.args.clone(),
        });
        let result = self
            .executor
            .execute(
                &call.name,
                &call.args,
                &mut self.approvals,
                Some(self.state.task_id.as_str()),
            )
            .await;

        match result {
            Ok(output) => {
                self.circuit.record_success();
                if let Some(operation_id) = output.pending {
                    if self.config.dangerous_operations.contains(&call.name) {
                        return CallStep::AwaitApproval { operation_id };
                    }
                    tracing::debug!(operation_id, tool = %call.name, "auto-approving operation");
                    return CallStep::Response(self.apply_operation(operation_id, &call.name).await);
                }
                if let Some(request) = &output.feedback_request {
                    if self.config.feedback_operations.contains(&call.name) {
                        return CallStep::AwaitFeedback {
                            request: request.clone(),
                        };
                    }
                }
                let response = output.to_response();
                self.emit_result(&call.name, true, &response);
                CallStep::Response(Part::response(call.name.clone(), response))
            }
            Err(err) => {
                self.record_tool_failure(&err);
                CallStep::Response(self.error_response(&call.name, err))
            }
        }
    }

    /// 批准并落地一个已入队的操作
    async fn apply_operation(&mut self, operation_id: OperationId, tool_name: &str) -> Part {
        let op = match self.approvals.approve(operation_id) {
            Ok(op) => op,
            Err(e) => {
                let category = match e {
                    ApprovalError::Expired(_) => ErrorCategory::MissingResource,
                    _ => ErrorCategory::Unknown,
                };
                return self.error_response(tool_name, ToolError::new(category, e.to_string()));
            }
        };
        match self.executor.apply(&op).await {
            Ok(output) => {
                self.circuit.record_success();
                let mut response = output.to_response();
                response.insert("applied".into(), json!(true));
                response.insert("operation_id".into(), json!(operation_id));
                self.emit_result(tool_name, true, &response);
                Part::response(tool_name, response)
            }
            Err(err) => {
                self.record_tool_failure(&err);
                self.error_response(tool_name, err)
            }
        }
    }

    fn record_tool_failure(&mut self, err: &ToolError) {
        if err.category != Some(ErrorCategory::UserDenied) {
            self.circuit.record_failure();
        }
    }

    /// 分类错误并生成回灌给模型的响应
    fn error_response(&mut self, tool_name: &str, err: ToolError) -> Part {
        let classification = self.classifier.classify(tool_name, &err);
        let mut response = Args::new();
        response.insert("error".into(), json!(err.message));
        response.insert("category".into(), json!(classification.category));
        response.insert("severity".into(), json!(classification.severity));
        let guidance = self.classifier.describe(&classification);
        if !guidance.is_empty() {
            response.insert("suggestion".into(), json!(guidance.trim()));
        }
        if classification.escalated {
            response.insert("escalated".into(), json!(true));
        }
        if let Some(warning) = self.executor.resilience().health_warning() {
            response.insert("health_warning".into(), json!(warning));
        }
        self.emit_result(tool_name, false, &response);
        Part::response(tool_name, response)
    }

    fn fail(&mut self, error: impl Into<String>, suggestion: Option<String>) -> LoopResult {
        let error = error.into();
        self.emit(LoopEvent::Error {
            text: error.clone(),
        });
        LoopResult::Failed {
            error,
            suggestion,
            iterations: self.state.iteration,
        }
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn emit_result(&self, tool: &str, ok: bool, response: &Args) {
        if self.event_tx.is_none() {
            return;
        }
        let preview: String = serde_json::to_string(response)
            .unwrap_or_default()
            .chars()
            .take(RESULT_PREVIEW_CHARS)
            .collect();
        self.emit(LoopEvent::ToolResult {
            tool: tool.to_string(),
            ok,
            preview,
        });
    }
}

fn status_response(tool_name: &str, status: &str, detail: &str) -> Part {
    let mut response = Args::new();
    response.insert("status".into(), json!(status));
    response.insert("detail".into(), json!(detail));
    Part::response(tool_name, response)
}

fn problem_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)\b(no|not|nope|broken|error|errors|wrong|fail\w*|doesn'?t|didn'?t|isn'?t|bug|issue|problem|crash\w*)\b",
            )
            .ok()
        })
        .as_ref()
}

fn confirm_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b(yes|yep|yeah|ok|okay|correct|confirmed|works|worked|perfect|great|looks good|lgtm)\b")
                .ok()
        })
        .as_ref()
}

/// 用户反馈的解读提示；问题描述优先于确认词
pub fn interpret_feedback(feedback: &str) -> &'static str {
    if problem_pattern().is_some_and(|re| re.is_match(feedback)) {
        "user reported a problem"
    } else if confirm_pattern().is_some_and(|re| re.is_match(feedback)) {
        "user confirmed correctness"
    } else {
        "user provided additional information"
    }
}
