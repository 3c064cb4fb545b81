//! 会话持久化
//!
//! SessionSnapshot 包含恢复一个（可能处于暂停状态的）会话所需的全部状态：
//! 对话历史、审批队列、熔断器、循环状态。进程重启后按 conversation_id 加载即可继续审批。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{ApprovalSnapshot, CircuitState, LoopState};
use crate::memory::Message;

/// 会话快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub history: Vec<Message>,
    pub approvals: ApprovalSnapshot,
    pub circuit: CircuitState,
    pub loop_state: LoopState,
    pub saved_at: DateTime<Utc>,
}

/// 快照存储后端
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<SessionSnapshot>>;
    async fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionSnapshot>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<SessionSnapshot>> {
        Ok(self.sessions.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(snapshot.conversation_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// 每个会话一个 JSON 文件：`{dir}/{conversation_id}.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, conversation_id: &str) -> anyhow::Result<PathBuf> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            anyhow::bail!("invalid conversation id: {conversation_id:?}");
        }
        Ok(self.dir.join(format!("{conversation_id}.json")))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    /// 文件不存在时返回 None
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<SessionSnapshot>> {
        let path = self.path_for(conversation_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// 先写临时文件再 rename，避免半写入的快照
    async fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        let path = self.path_for(&snapshot.conversation_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), "session snapshot saved");
        Ok(())
    }
}
