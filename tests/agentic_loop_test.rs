//! Agentic 主循环集成测试：脚本化模型 + 内存实例树

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apiary::core::{ErrorCategory, LoopResult, OperationStatus, ToolError};
use apiary::llm::{LlmError, ScriptedLlmClient};
use apiary::memory::{Args, CompressionConfig, Message, Part, Role, SessionSnapshot};
use apiary::react::{AgentSession, SessionConfig};
use apiary::tools::{register_workspace_tools, InstanceTree, Tool, ToolOutput, ToolRegistry};
use async_trait::async_trait;
use serde_json::{json, Value};

fn args(v: Value) -> Args {
    v.as_object().cloned().unwrap_or_default()
}

fn call(name: &str, v: Value) -> Part {
    Part::call(name, args(v))
}

fn reply(parts: Vec<Part>) -> Message {
    Message::model(parts)
}

fn done(text: &str) -> Message {
    Message::model(vec![Part::text(text)])
}

fn workspace_registry(tree: &InstanceTree) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_workspace_tools(&mut registry, tree).unwrap();
    registry
}

fn session(
    llm: &Arc<ScriptedLlmClient>,
    registry: ToolRegistry,
    config: SessionConfig,
) -> AgentSession {
    AgentSession::new(llm.clone(), registry, config)
}

/// 历史中最后一条 Tool 消息的响应
fn last_tool_responses(messages: &[Message]) -> Vec<(String, Args)> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .map(|m| {
            m.parts
                .iter()
                .filter_map(|p| match p {
                    Part::FunctionResponse { name, response } => {
                        Some((name.clone(), response.clone()))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 总是以不可重试错误失败的只读工具
struct BrokenTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "inspect_physics"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    async fn execute(&self, _args: &Args) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::new(ErrorCategory::PropertyError, "Velocity is not a valid member"))
    }
}

#[tokio::test]
async fn test_plain_answer_completes_at_first_iteration() {
    let llm = Arc::new(ScriptedLlmClient::new(vec![done("Done.")]));
    let mut session = session(&llm, ToolRegistry::new(), SessionConfig::default());

    let result = session.start("say done").await;

    assert_eq!(
        result,
        LoopResult::Completed {
            text: "Done.".to_string(),
            iterations: 1
        }
    );
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn test_iteration_limit_stops_without_model_call() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(
        (0..60)
            .map(|_| reply(vec![call("read_instance", json!({"path": "Workspace"}))]))
            .collect(),
    ));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let result = session.start("loop forever").await;

    assert_eq!(result.error(), Some("exceeded maximum iterations (50)"));
    assert_eq!(result.iterations(), 51);
    assert_eq!(llm.invocation_count(), 50);
    assert!(session.history().pairing_is_consistent());
}

#[tokio::test]
async fn test_approval_pause_resumes_at_next_call() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![
            Part::text("Creating the folder."),
            call("read_instance", json!({"path": "Workspace"})),
            call("create_instance", json!({"path": "Workspace/Folder", "class_name": "Folder"})),
            call("read_instance", json!({"path": "Workspace/Folder"})),
        ]),
        done("Done."),
    ]));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let paused = session.start("make a folder").await;
    let LoopResult::AwaitingApproval {
        operation_id,
        tool_name,
        iterations,
        ..
    } = paused
    else {
        panic!("expected approval pause, got {paused:?}");
    };
    assert_eq!(tool_name, "create_instance");
    assert_eq!(iterations, 1);
    assert!(!tree.contains("Workspace/Folder").await);
    assert!(session.state().paused.is_some());

    let result = session.resume_with_approval(true).await;
    assert_eq!(
        result,
        LoopResult::Completed {
            text: "Creating the folder.\n\nDone.".to_string(),
            iterations: 2
        }
    );
    assert!(session.state().paused.is_none());
    assert!(tree.contains("Workspace/Folder").await);
    assert_eq!(
        session.approvals().get(operation_id).unwrap().status,
        OperationStatus::Approved
    );

    // 每个调用恰好一个响应，且顺序一致
    let responses = last_tool_responses(session.history().messages());
    let names: Vec<&str> = responses.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["read_instance", "create_instance", "read_instance"]);
    assert_eq!(responses[1].1["applied"], json!(true));
    assert_eq!(responses[2].1["class_name"], json!("Folder"));
    assert!(session.history().pairing_is_consistent());

    // 第二次调用模型时已看到完整的批次响应
    let seen = llm.history_at(1).unwrap();
    assert_eq!(seen.last().unwrap().function_response_count(), 3);
}

#[tokio::test]
async fn test_create_after_missing_read_reaches_approval() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call("read_instance", json!({"path": "Workspace/Folder"}))]),
        reply(vec![call(
            "create_instance",
            json!({"path": "Workspace/Folder", "class_name": "Folder"}),
        )]),
        done("Folder created."),
    ]));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let paused = session.start("make sure the folder exists").await;
    let LoopResult::AwaitingApproval {
        operation_id,
        tool_name,
        iterations,
        ..
    } = paused
    else {
        panic!("expected approval pause, got {paused:?}");
    };
    assert_eq!(tool_name, "create_instance");
    assert_eq!(iterations, 2);

    let first_batch = last_tool_responses(&session.history().messages()[..3]);
    assert_eq!(first_batch[0].1["category"], json!("missing_resource"));

    let result = session.resume_with_approval(true).await;
    assert!(result.is_completed());
    assert!(tree.contains("Workspace/Folder").await);
    assert_eq!(
        session.approvals().get(operation_id).unwrap().status,
        OperationStatus::Approved
    );
}

#[tokio::test]
async fn test_denied_operation_is_reported_to_model() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call("delete_instance", json!({"path": "Workspace/Old"}))]),
        done("Understood, nothing was deleted."),
    ]));
    tree.insert("Workspace/Old", apiary::tools::Instance::new("Folder")).await;
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let LoopResult::AwaitingApproval { operation_id, .. } = session.start("clean up").await else {
        panic!("expected approval pause");
    };
    let result = session.resume_with_approval(false).await;

    assert!(result.is_completed());
    assert!(tree.contains("Workspace/Old").await);
    assert_eq!(
        session.approvals().get(operation_id).unwrap().status,
        OperationStatus::Rejected
    );
    let responses = last_tool_responses(session.history().messages());
    assert_eq!(responses[0].1["category"], json!("user_denied"));
    assert_eq!(session.circuit().state().task_failures, 0);
}

#[tokio::test]
async fn test_feedback_pause_injects_interpretation() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![call(
            "request_user_verification",
            json!({"question": "Does the door open now?"}),
        )]),
        done("I'll look at the hinge script."),
    ]));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let paused = session.start("fix the door").await;
    assert_eq!(
        paused,
        LoopResult::AwaitingFeedback {
            tool_name: "request_user_verification".to_string(),
            request: "Does the door open now?".to_string(),
            iterations: 1
        }
    );

    let result = session.resume_with_feedback("No, it is still stuck").await;
    assert!(result.is_completed());
    let responses = last_tool_responses(session.history().messages());
    assert_eq!(responses[0].1["interpretation"], json!("user reported a problem"));
    assert_eq!(responses[0].1["user_feedback"], json!("No, it is still stuck"));
}

#[tokio::test]
async fn test_resume_after_task_moved_on_is_expired() {
    let tree = InstanceTree::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![
            call("create_instance", json!({"path": "Workspace/Folder", "class_name": "Folder"})),
            call("read_instance", json!({"path": "Workspace/Folder"})),
        ]),
        done("OK, never mind."),
    ]));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let LoopResult::AwaitingApproval { operation_id, .. } = session.start("make a folder").await
    else {
        panic!("expected approval pause");
    };
    let result = session.continue_with("actually, skip that").await;
    assert!(result.is_completed());
    assert!(session.history().pairing_is_consistent());

    let abandoned = session
        .history()
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.parts.clone())
        .unwrap();
    assert_eq!(abandoned.len(), 2);

    let history_len = session.history().len();
    let result = session.resume_with_approval(true).await;
    assert!(result.error().unwrap().contains("expired"));
    assert_eq!(session.history().len(), history_len);
    assert_eq!(
        session.approvals().get(operation_id).unwrap().status,
        OperationStatus::Pending
    );
    assert!(!tree.contains("Workspace/Folder").await);
    assert_eq!(llm.invocation_count(), 2);
}

#[tokio::test]
async fn test_open_circuit_blocks_without_invoking_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(BrokenTool {
            calls: calls.clone(),
        })
        .unwrap();
    let mut config = SessionConfig::default();
    config.circuit.failure_threshold = 2;

    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![
            call("inspect_physics", json!({"n": 1})),
            call("inspect_physics", json!({"n": 2})),
            call("inspect_physics", json!({"n": 3})),
        ]),
        reply(vec![
            call("inspect_physics", json!({"n": 4})),
            call("inspect_physics", json!({"n": 5})),
        ]),
        reply(vec![call("inspect_physics", json!({"n": 6}))]),
        done("unreachable"),
    ]));
    let mut session = session(&llm, registry, config);

    let result = session.start("check physics").await;

    assert!(result.error().unwrap().contains("circuit breaker"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(llm.invocation_count(), 3);
    assert!(session.history().pairing_is_consistent());

    let second_batch = session
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .nth(1)
        .unwrap();
    let Part::FunctionResponse { response, .. } = &second_batch.parts[1] else {
        panic!("expected function response");
    };
    assert_eq!(response["status"], json!("skipped"));
}

#[tokio::test]
async fn test_repeated_identical_failure_short_circuits() {
    let tree = InstanceTree::new();
    tree.insert_script("Workspace/Main", "print('hello')").await;
    let edit = || {
        call(
            "edit_script",
            json!({"path": "Workspace/Main", "search": "print('bye')", "replace": ""}),
        )
    };
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        reply(vec![edit(), edit(), edit(), edit()]),
        done("Giving up on that edit."),
    ]));
    let mut session = session(&llm, workspace_registry(&tree), SessionConfig::default());

    let result = session.start("edit the script").await;

    assert!(result.is_completed());
    let responses = last_tool_responses(session.history().messages());
    assert_eq!(responses.len(), 4);
    for (_, response) in &responses[..3] {
        assert!(response["error"].as_str().unwrap().contains("search content not found"));
    }
    assert!(responses[3].1["error"].as_str().unwrap().contains("stop repeating"));
    assert!(session.approvals().is_empty());
}

#[tokio::test]
async fn test_model_failure_is_returned_verbatim() {
    let llm = Arc::new(ScriptedLlmClient::new(vec![]));
    llm.push_error(LlmError::Request("connection refused by upstream".into()));
    let mut session = session(&llm, ToolRegistry::new(), SessionConfig::default());

    let result = session.start("hello").await;

    assert_eq!(
        result,
        LoopResult::Failed {
            error: "connection refused by upstream".to_string(),
            suggestion: None,
            iterations: 1
        }
    );
}

#[tokio::test]
async fn test_pairing_holds_after_compression() {
    let tree = InstanceTree::new();
    let mut replies: Vec<Message> = (0..12)
        .map(|i| {
            reply(vec![
                Part::text(format!("step {i}: {}", "thinking ".repeat(30))),
                call("read_instance", json!({"path": "Workspace"})),
            ])
        })
        .collect();
    replies.push(done("Done."));
    let llm = Arc::new(ScriptedLlmClient::new(replies));
    let config = SessionConfig {
        compression: CompressionConfig {
            token_threshold: 400,
            messages_to_preserve: 4,
        },
        ..SessionConfig::default()
    };
    let mut session = session(&llm, workspace_registry(&tree), config);

    let result = session.start("inspect repeatedly").await;

    assert!(result.is_completed());
    let messages = session.history().messages();
    assert_eq!(messages[0].role, Role::System);
    assert!(messages[0].text().contains("messages omitted"));
    assert!(session.history().pairing_is_consistent());
    assert!(session.history().len() < 26);
}

#[tokio::test]
async fn test_snapshot_restores_paused_session_after_restart() {
    let tree = InstanceTree::new();
    let first = Arc::new(ScriptedLlmClient::new(vec![reply(vec![call(
        "create_instance",
        json!({"path": "Workspace/Lamp", "class_name": "Part"}),
    )])]));
    let mut original = session(&first, workspace_registry(&tree), SessionConfig::default());
    assert!(original.start("add a lamp").await.is_paused());

    let saved = serde_json::to_string(&original.snapshot()).unwrap();
    drop(original);

    let second = Arc::new(ScriptedLlmClient::new(vec![done("Lamp added.")]));
    let mut restored = session(&second, workspace_registry(&tree), SessionConfig::default());
    let snapshot: SessionSnapshot = serde_json::from_str(&saved).unwrap();
    restored.restore(snapshot);

    let result = restored.resume_with_approval(true).await;
    assert_eq!(result.text(), Some("Lamp added."));
    assert!(tree.contains("Workspace/Lamp").await);
    assert!(restored.history().pairing_is_consistent());
}
