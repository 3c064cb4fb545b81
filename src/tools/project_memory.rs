//! 项目记忆工具：跨任务的键值笔记（约定、已知结构、踩过的坑）

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::core::{ErrorCategory, ToolError};
use crate::memory::Args;
use crate::tools::{Tool, ToolCategory, ToolOutput};

/// 项目记忆后端
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}

/// 进程内键值存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryKv {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

fn store_error(e: anyhow::Error) -> ToolError {
    ToolError::opaque(format!("project memory unavailable: {e}"))
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SaveArgs {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct LoadArgs {
    /// 省略时返回全部键
    #[serde(default)]
    key: Option<String>,
}

fn parse<T: serde::de::DeserializeOwned>(tool: &str, args: &Args) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| {
        ToolError::new(
            ErrorCategory::TypeError,
            format!("invalid arguments for {tool}: {e}"),
        )
    })
}

fn object(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        _ => Args::new(),
    }
}

pub struct ProjectMemorySaveTool {
    store: Arc<dyn KeyValueStore>,
}

impl ProjectMemorySaveTool {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ProjectMemorySaveTool {
    fn name(&self) -> &str {
        "project_memory_save"
    }

    fn description(&self) -> &str {
        "Save a project note for later tasks. Args: {\"key\", \"value\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Project
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(SaveArgs)).unwrap_or_else(|_| json!({"type": "object"}))
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let SaveArgs { key, value } = parse(self.name(), args)?;
        if key.trim().is_empty() {
            return Err(ToolError::new(ErrorCategory::TypeError, "key must not be empty"));
        }
        self.store.save(&key, &value).await.map_err(store_error)?;
        Ok(ToolOutput::new(object(json!({ "saved": key }))))
    }
}

pub struct ProjectMemoryLoadTool {
    store: Arc<dyn KeyValueStore>,
}

impl ProjectMemoryLoadTool {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ProjectMemoryLoadTool {
    fn name(&self) -> &str {
        "project_memory_load"
    }

    fn description(&self) -> &str {
        "Load a project note by key, or list keys when no key is given. Args: {\"key\"?}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Project
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schema_for!(LoadArgs)).unwrap_or_else(|_| json!({"type": "object"}))
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let LoadArgs { key } = parse(self.name(), args)?;
        let Some(key) = key else {
            let keys = self.store.keys().await.map_err(store_error)?;
            return Ok(ToolOutput::new(object(json!({ "keys": keys }))));
        };
        match self.store.load(&key).await.map_err(store_error)? {
            Some(value) => Ok(ToolOutput::new(object(json!({ "key": key, "value": value })))),
            None => Err(ToolError::new(
                ErrorCategory::MissingResource,
                format!("no project memory stored under `{key}`"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load_and_list() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let save = ProjectMemorySaveTool::new(store.clone());
        let load = ProjectMemoryLoadTool::new(store);

        save.execute(&object(json!({"key": "naming", "value": "PascalCase models"})))
            .await
            .unwrap();
        let out = load.execute(&object(json!({"key": "naming"}))).await.unwrap();
        assert_eq!(out.result["value"], json!("PascalCase models"));

        let out = load.execute(&Args::new()).await.unwrap();
        assert_eq!(out.result["keys"], json!(["naming"]));
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let load = ProjectMemoryLoadTool::new(Arc::new(InMemoryKv::new()));
        let err = load.execute(&object(json!({"key": "x"}))).await.unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::MissingResource));
    }
}
