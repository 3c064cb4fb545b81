//! 会话构建器：统一的会话初始化逻辑
//!
//! 由 AppConfig 生成各组件配置，注册实例树与项目记忆工具，组装 AgentSession。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{LlmClient, MockLlmClient, ModelSummarizer};
use crate::react::{AgentSession, LoopEvent};
use crate::tools::{
    register_workspace_tools, InMemoryKv, InstanceTree, KeyValueStore, ProjectMemoryLoadTool,
    ProjectMemorySaveTool, ToolRegistry,
};

/// 会话构建器
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tree: InstanceTree,
    project_memory: Arc<dyn KeyValueStore>,
    summarize: bool,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            tree: InstanceTree::new(),
            project_memory: Arc::new(InMemoryKv::new()),
            summarize: true,
            event_tx: None,
        }
    }

    /// 未设置时使用 MockLlmClient
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tree(mut self, tree: InstanceTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_project_memory(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.project_memory = store;
        self
    }

    /// 是否用同一模型生成压缩摘要（关闭时只做机械截断）
    pub fn with_summarizer(mut self, enable: bool) -> Self {
        self.summarize = enable;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 构建工具注册表（所有接入方式共享同一套工具）
    pub fn build_tool_registry(&self) -> Result<ToolRegistry, AgentError> {
        let mut tools = ToolRegistry::new();
        register_workspace_tools(&mut tools, &self.tree)?;
        tools.register(ProjectMemorySaveTool::new(self.project_memory.clone()))?;
        tools.register(ProjectMemoryLoadTool::new(self.project_memory.clone()))?;
        tracing::debug!(tools = ?tools.tool_names(), "tool registry built");
        Ok(tools)
    }

    pub fn build(self) -> Result<AgentSession, AgentError> {
        let registry = self.build_tool_registry()?;
        let session_config = self.config.session_config();
        if session_config.max_iterations == 0 {
            return Err(AgentError::ConfigError(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }
        for name in session_config
            .dangerous_operations
            .iter()
            .chain(session_config.feedback_operations.iter())
        {
            if !registry.contains(name) {
                tracing::warn!(tool = %name, "configured operation has no registered tool");
            }
        }

        let llm = self.llm.unwrap_or_else(|| {
            tracing::warn!("no model client configured, using mock model");
            Arc::new(MockLlmClient)
        });
        let mut session = AgentSession::new(llm.clone(), registry, session_config);
        if self.summarize {
            session = session.with_summarizer(Arc::new(ModelSummarizer::new(llm)));
        }
        if let Some(tx) = self.event_tx {
            session = session.with_event_tx(tx);
        }
        Ok(session)
    }
}
