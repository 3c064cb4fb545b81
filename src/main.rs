//! Apiary 无界面入口
//!
//! 从标准输入逐行读取：普通文本开始新任务（或在已有对话上继续），
//! `/approve`、`/deny` 回应审批，`/feedback <text>` 回应验证请求，`/new <text>` 清空后开始新任务，
//! `/snapshot` 打印会话 ID，`/restore <id>` 从快照恢复，`/quit` 退出。

use anyhow::Context;
use apiary::core::{create_agent, AgentHandle, LoopResult};
use tokio::io::{AsyncBufReadExt, BufReader};

fn print_result(result: &LoopResult) {
    match result {
        LoopResult::Completed { text, iterations } => {
            println!("{text}\n[completed after {iterations} iteration(s)]");
        }
        LoopResult::AwaitingApproval {
            operation_id,
            tool_name,
            data,
            ..
        } => {
            let data = serde_json::to_string_pretty(data).unwrap_or_default();
            println!("[approval #{operation_id}] {tool_name}\n{data}\n/approve or /deny?");
        }
        LoopResult::AwaitingFeedback { request, .. } => {
            println!("[verification] {request}\nreply with /feedback <text>");
        }
        LoopResult::Failed {
            error, suggestion, ..
        } => {
            println!("[failed] {error}");
            if let Some(s) = suggestion {
                println!("hint: {s}");
            }
        }
    }
}

async fn dispatch(handle: &AgentHandle, line: &str, started: &mut bool) -> anyhow::Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    let result = match command {
        "/quit" | "/exit" => return Ok(false),
        "/approve" => handle.approve(true).await?,
        "/deny" => handle.approve(false).await?,
        "/feedback" => handle.feedback(rest).await?,
        "/new" => {
            *started = true;
            handle.start(rest).await?
        }
        "/snapshot" => {
            let snapshot = handle.snapshot().await?;
            println!(
                "conversation {} ({} messages)",
                snapshot.conversation_id,
                snapshot.history.len()
            );
            return Ok(true);
        }
        "/restore" => {
            if handle.restore(rest).await? {
                *started = true;
                println!("restored {rest}");
            } else {
                println!("no saved session {rest}");
            }
            return Ok(true);
        }
        _ if !*started => {
            *started = true;
            handle.start(line).await?
        }
        _ => handle.continue_with(line).await?,
    };
    print_result(&result);
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    apiary::observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let handle = create_agent(config_path)
        .await
        .context("Failed to create agent")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut started = false;
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match dispatch(&handle, line, &mut started).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e}"),
        }
    }
    handle.quit();
    Ok(())
}
