//! Agent 运行时：单会话 actor
//!
//! 会话由后台 tokio 任务独占；调用方通过 AgentHandle 发送命令（mpsc），结果经 oneshot 返回。
//! 同一会话同时只允许一轮（SessionSupervisor），每轮结束后可选地保存快照。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::{load_config, AppConfig};
use crate::core::{AgentBuilder, AgentError, LoopResult, SessionSupervisor, TurnGuard};
use crate::memory::{JsonFileStore, SessionSnapshot, SessionStore};
use crate::react::AgentSession;

/// 一轮的输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRequest {
    Start(String),
    Continue(String),
    Approve(bool),
    Feedback(String),
}

/// 发往 actor 的命令
#[derive(Debug)]
pub enum Command {
    Turn {
        request: TurnRequest,
        reply: oneshot::Sender<LoopResult>,
        /// 随命令一起移交，actor 处理完本轮后 drop
        guard: TurnGuard,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// 从存储加载指定会话；不存在时返回 false
    Restore {
        conversation_id: String,
        reply: oneshot::Sender<Result<bool, AgentError>>,
    },
    Quit,
}

/// 调用方持有的句柄
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<Command>,
    supervisor: SessionSupervisor,
}

impl AgentHandle {
    async fn turn(&self, request: TurnRequest) -> Result<LoopResult, AgentError> {
        let guard = self.supervisor.try_begin()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Turn {
                request,
                reply,
                guard,
            })
            .map_err(|_| AgentError::AgentStopped)?;
        rx.await.map_err(|_| AgentError::AgentStopped)
    }

    pub async fn start(&self, message: impl Into<String>) -> Result<LoopResult, AgentError> {
        self.turn(TurnRequest::Start(message.into())).await
    }

    pub async fn continue_with(
        &self,
        message: impl Into<String>,
    ) -> Result<LoopResult, AgentError> {
        self.turn(TurnRequest::Continue(message.into())).await
    }

    pub async fn approve(&self, approved: bool) -> Result<LoopResult, AgentError> {
        self.turn(TurnRequest::Approve(approved)).await
    }

    pub async fn feedback(&self, text: impl Into<String>) -> Result<LoopResult, AgentError> {
        self.turn(TurnRequest::Feedback(text.into())).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| AgentError::AgentStopped)?;
        rx.await.map_err(|_| AgentError::AgentStopped)
    }

    pub async fn restore(&self, conversation_id: impl Into<String>) -> Result<bool, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Restore {
                conversation_id: conversation_id.into(),
                reply,
            })
            .map_err(|_| AgentError::AgentStopped)?;
        rx.await.map_err(|_| AgentError::AgentStopped)?
    }

    pub fn is_busy(&self) -> bool {
        self.supervisor.is_busy()
    }

    pub fn quit(&self) {
        let _ = self.tx.send(Command::Quit);
        self.supervisor.shutdown();
    }
}

/// 在后台任务中运行会话，返回句柄
pub fn spawn_agent(mut session: AgentSession, store: Option<Arc<dyn SessionStore>>) -> AgentHandle {
    let supervisor = SessionSupervisor::new();
    let shutdown = supervisor.shutdown_token();
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Turn { request, reply, guard } => {
                            let result = match request {
                                TurnRequest::Start(message) => session.start(&message).await,
                                TurnRequest::Continue(message) => session.continue_with(&message).await,
                                TurnRequest::Approve(approved) => session.resume_with_approval(approved).await,
                                TurnRequest::Feedback(text) => session.resume_with_feedback(&text).await,
                            };
                            if let Some(store) = &store {
                                if let Err(e) = store.save(&session.snapshot()).await {
                                    tracing::warn!(error = %e, "failed to save session snapshot");
                                }
                            }
                            drop(guard);
                            let _ = reply.send(result);
                        }
                        Command::Snapshot { reply } => {
                            let _ = reply.send(session.snapshot());
                        }
                        Command::Restore { conversation_id, reply } => {
                            let result = match &store {
                                None => Err(AgentError::Persistence("no session store configured".to_string())),
                                Some(store) => match store.load(&conversation_id).await {
                                    Ok(Some(snapshot)) => {
                                        session.restore(snapshot);
                                        tracing::info!(%conversation_id, "session restored");
                                        Ok(true)
                                    }
                                    Ok(None) => Ok(false),
                                    Err(e) => Err(AgentError::Persistence(e.to_string())),
                                },
                            };
                            let _ = reply.send(result);
                        }
                        Command::Quit => break,
                    }
                }
            }
        }
        tracing::info!("agent stopped");
    });

    AgentHandle { tx, supervisor }
}

/// 加载配置、构建会话并启动运行时
pub async fn create_agent(config_path: Option<PathBuf>) -> anyhow::Result<AgentHandle> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let store: Option<Arc<dyn SessionStore>> = cfg
        .app
        .session_dir
        .as_ref()
        .map(|dir| Arc::new(JsonFileStore::new(dir)) as Arc<dyn SessionStore>);
    let session = AgentBuilder::new(cfg).build()?;
    tracing::info!(conversation_id = session.conversation_id(), "agent created");
    Ok(spawn_agent(session, store))
}
