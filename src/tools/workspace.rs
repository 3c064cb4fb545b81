//! 内存实例树工具环境
//!
//! 以「/」分隔的路径组织实例（根为 Workspace），提供读、写（需审批）和请求用户验证三类工具。
//! 写工具入队前校验父节点 / 目标是否存在（含本任务中排队待建的实例）、类名、重名与搜索内容。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::core::{AgentError, ErrorCategory, PendingOperation, ToolError};
use crate::memory::Args;
use crate::tools::{Tool, ToolCategory, ToolOutput, ToolRegistry};

pub const ROOT: &str = "Workspace";

/// 可创建的类名
const KNOWN_CLASSES: &[&str] = &[
    "Folder",
    "Model",
    "Part",
    "MeshPart",
    "Script",
    "LocalScript",
    "ModuleScript",
    "Configuration",
    "StringValue",
    "NumberValue",
    "BoolValue",
];

const SCRIPT_CLASSES: &[&str] = &["Script", "LocalScript", "ModuleScript"];

/// 只读属性
const READ_ONLY_PROPERTIES: &[&str] = &["ClassName", "Parent", "Name"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub class_name: String,
    pub properties: BTreeMap<String, Value>,
    pub source: Option<String>,
}

impl Instance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: BTreeMap::new(),
            source: None,
        }
    }

    pub fn is_script(&self) -> bool {
        SCRIPT_CLASSES.contains(&self.class_name.as_str())
    }
}

/// 共享实例树（工具之间共用同一份）
#[derive(Debug, Clone)]
pub struct InstanceTree {
    inner: Arc<RwLock<BTreeMap<String, Instance>>>,
}

impl Default for InstanceTree {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert(ROOT.to_string(), Instance::new(ROOT));
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

impl InstanceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入（不经审批），用于初始化与测试
    pub async fn insert(&self, path: impl Into<String>, instance: Instance) {
        self.inner.write().await.insert(path.into(), instance);
    }

    pub async fn insert_script(&self, path: impl Into<String>, source: impl Into<String>) {
        let mut script = Instance::new("Script");
        script.source = Some(source.into());
        self.insert(path, script).await;
    }

    pub async fn get(&self, path: &str) -> Option<Instance> {
        self.inner.read().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.inner.read().await.contains_key(path)
    }

    pub async fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.inner
            .read()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn not_found(path: &str) -> ToolError {
    ToolError::new(ErrorCategory::MissingResource, format!("Path not found: {path}"))
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: &Args) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| {
        ToolError::new(
            ErrorCategory::TypeError,
            format!("invalid arguments for {tool}: {e}"),
        )
    })
}

/// 本任务中排队待建的实例路径
fn queued_creates(queued: &[PendingOperation]) -> impl Iterator<Item = &str> {
    queued
        .iter()
        .filter(|op| op.kind == "create_instance")
        .filter_map(|op| op.data.get("path").and_then(Value::as_str))
}

async fn exists_or_queued(tree: &InstanceTree, path: &str, queued: &[PendingOperation]) -> bool {
    tree.contains(path).await || queued_creates(queued).any(|p| p == path)
}

fn result(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        _ => Args::new(),
    }
}

// ---------- read_instance ----------

#[derive(Debug, Deserialize, JsonSchema)]
struct PathArgs {
    /// 实例路径，如 Workspace/Model/Part
    path: String,
}

pub struct ReadInstanceTool {
    tree: InstanceTree,
}

impl ReadInstanceTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl Tool for ReadInstanceTool {
    fn name(&self) -> &str {
        "read_instance"
    }

    fn description(&self) -> &str {
        "Read an instance's class, properties and children. Args: {\"path\": \"Workspace/...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let PathArgs { path } = parse_args(self.name(), args)?;
        let instance = self.tree.get(&path).await.ok_or_else(|| not_found(&path))?;
        let children = self.tree.children(&path).await;
        Ok(ToolOutput::new(result(json!({
            "path": path,
            "class_name": instance.class_name,
            "properties": instance.properties,
            "children": children,
        }))))
    }
}

// ---------- read_script ----------

pub struct ReadScriptTool {
    tree: InstanceTree,
}

impl ReadScriptTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl Tool for ReadScriptTool {
    fn name(&self) -> &str {
        "read_script"
    }

    fn description(&self) -> &str {
        "Read a script's source. Args: {\"path\": \"Workspace/...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    fn required_output_field(&self) -> Option<&str> {
        Some("source")
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let PathArgs { path } = parse_args(self.name(), args)?;
        let instance = self.tree.get(&path).await.ok_or_else(|| not_found(&path))?;
        if !instance.is_script() {
            return Err(ToolError::new(
                ErrorCategory::InvalidClass,
                format!("{path} is a {}, not a script class", instance.class_name),
            ));
        }
        Ok(ToolOutput::new(result(json!({
            "path": path,
            "source": instance.source,
        }))))
    }
}

// ---------- create_instance ----------

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateArgs {
    /// 新实例的完整路径（父路径必须已存在或已排队创建）
    path: String,
    class_name: String,
    #[serde(default)]
    properties: Option<BTreeMap<String, Value>>,
    /// 脚本类实例的初始源码
    #[serde(default)]
    source: Option<String>,
}

pub struct CreateInstanceTool {
    tree: InstanceTree,
}

impl CreateInstanceTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }

    async fn validate(&self, a: &CreateArgs, queued: &[PendingOperation]) -> Result<(), ToolError> {
        if !KNOWN_CLASSES.contains(&a.class_name.as_str()) {
            return Err(ToolError::new(
                ErrorCategory::InvalidClass,
                format!("`{}` is not a valid class name", a.class_name),
            ));
        }
        let parent = parent_of(&a.path).ok_or_else(|| {
            ToolError::new(
                ErrorCategory::ParentError,
                format!("{} has no parent path", a.path),
            )
        })?;
        if !exists_or_queued(&self.tree, parent, queued).await {
            return Err(ToolError::new(
                ErrorCategory::ParentError,
                format!("parent `{parent}` does not exist"),
            ));
        }
        if exists_or_queued(&self.tree, &a.path, queued).await {
            return Err(ToolError::new(
                ErrorCategory::AlreadyExists,
                format!("{} already exists", a.path),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for CreateInstanceTool {
    fn name(&self) -> &str {
        "create_instance"
    }

    fn description(&self) -> &str {
        "Create a new instance (requires approval). Args: {\"path\", \"class_name\", \"properties\"?, \"source\"?}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<CreateArgs>()
    }

    async fn check_preconditions(
        &self,
        args: &Args,
        queued: &[PendingOperation],
    ) -> Result<(), ToolError> {
        let a: CreateArgs = parse_args(self.name(), args)?;
        self.validate(&a, queued).await
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let a: CreateArgs = parse_args(self.name(), args)?;
        self.validate(&a, &[]).await?;
        let mut instance = Instance::new(&a.class_name);
        instance.properties = a.properties.unwrap_or_default();
        if instance.is_script() {
            instance.source = Some(a.source.unwrap_or_default());
        }
        self.tree.insert(a.path.clone(), instance).await;
        Ok(ToolOutput::new(result(json!({
            "created": a.path,
            "class_name": a.class_name,
        }))))
    }
}

// ---------- set_property ----------

#[derive(Debug, Deserialize, JsonSchema)]
struct SetPropertyArgs {
    path: String,
    property: String,
    value: Value,
}

pub struct SetPropertyTool {
    tree: InstanceTree,
}

impl SetPropertyTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Tool for SetPropertyTool {
    fn name(&self) -> &str {
        "set_property"
    }

    fn description(&self) -> &str {
        "Set a property on an instance (requires approval). Args: {\"path\", \"property\", \"value\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SetPropertyArgs>()
    }

    async fn check_preconditions(
        &self,
        args: &Args,
        queued: &[PendingOperation],
    ) -> Result<(), ToolError> {
        let a: SetPropertyArgs = parse_args(self.name(), args)?;
        if READ_ONLY_PROPERTIES.contains(&a.property.as_str()) {
            return Err(ToolError::new(
                ErrorCategory::PropertyError,
                format!("property {} is read-only", a.property),
            ));
        }
        if !exists_or_queued(&self.tree, &a.path, queued).await {
            return Err(not_found(&a.path));
        }
        Ok(())
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let a: SetPropertyArgs = parse_args(self.name(), args)?;
        if READ_ONLY_PROPERTIES.contains(&a.property.as_str()) {
            return Err(ToolError::new(
                ErrorCategory::PropertyError,
                format!("property {} is read-only", a.property),
            ));
        }
        let mut tree = self.tree.inner.write().await;
        let instance = tree.get_mut(&a.path).ok_or_else(|| not_found(&a.path))?;
        if let Some(existing) = instance.properties.get(&a.property) {
            let (want, got) = (json_type(existing), json_type(&a.value));
            if want != got {
                return Err(ToolError::new(
                    ErrorCategory::TypeError,
                    format!("type mismatch for {}: expected {want}, got {got}", a.property),
                ));
            }
        }
        instance.properties.insert(a.property.clone(), a.value.clone());
        Ok(ToolOutput::new(result(json!({
            "path": a.path,
            "property": a.property,
            "value": a.value,
        }))))
    }
}

// ---------- edit_script ----------

#[derive(Debug, Deserialize, JsonSchema)]
struct EditScriptArgs {
    path: String,
    /// 要替换的原文，必须在源码中恰好出现一次
    search: String,
    replace: String,
}

pub struct EditScriptTool {
    tree: InstanceTree,
}

impl EditScriptTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }
}

fn check_search(path: &str, source: &str, search: &str) -> Result<(), ToolError> {
    match source.matches(search).count() {
        0 => Err(ToolError::new(
            ErrorCategory::SearchFailed,
            format!("search content not found in {path}"),
        )),
        1 => Ok(()),
        n => Err(ToolError::new(
            ErrorCategory::AmbiguousMatch,
            format!("search content matched {n} times in {path}"),
        )),
    }
}

#[async_trait]
impl Tool for EditScriptTool {
    fn name(&self) -> &str {
        "edit_script"
    }

    fn description(&self) -> &str {
        "Replace an exact snippet in a script (requires approval). Args: {\"path\", \"search\", \"replace\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EditScriptArgs>()
    }

    async fn check_preconditions(
        &self,
        args: &Args,
        queued: &[PendingOperation],
    ) -> Result<(), ToolError> {
        let a: EditScriptArgs = parse_args(self.name(), args)?;
        match self.tree.get(&a.path).await {
            Some(instance) if instance.is_script() => {
                check_search(&a.path, instance.source.as_deref().unwrap_or(""), &a.search)
            }
            Some(instance) => Err(ToolError::new(
                ErrorCategory::InvalidClass,
                format!("{} is a {}, not a script class", a.path, instance.class_name),
            )),
            // 排队待建的脚本：内容在落地前无法校验
            None if queued_creates(queued).any(|p| p == a.path) => Ok(()),
            None => Err(not_found(&a.path)),
        }
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let a: EditScriptArgs = parse_args(self.name(), args)?;
        let mut tree = self.tree.inner.write().await;
        let instance = tree.get_mut(&a.path).ok_or_else(|| not_found(&a.path))?;
        let source = instance.source.get_or_insert_with(String::new);
        check_search(&a.path, source, &a.search)?;
        *source = source.replacen(&a.search, &a.replace, 1);
        Ok(ToolOutput::new(result(json!({
            "path": a.path,
            "edited": true,
        }))))
    }
}

// ---------- delete_instance ----------

pub struct DeleteInstanceTool {
    tree: InstanceTree,
}

impl DeleteInstanceTool {
    pub fn new(tree: InstanceTree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl Tool for DeleteInstanceTool {
    fn name(&self) -> &str {
        "delete_instance"
    }

    fn description(&self) -> &str {
        "Delete an instance and its descendants (requires approval). Args: {\"path\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    async fn check_preconditions(
        &self,
        args: &Args,
        queued: &[PendingOperation],
    ) -> Result<(), ToolError> {
        let PathArgs { path } = parse_args(self.name(), args)?;
        if path == ROOT {
            return Err(ToolError::new(
                ErrorCategory::ParentError,
                "the root instance cannot be deleted",
            ));
        }
        if !exists_or_queued(&self.tree, &path, queued).await {
            return Err(not_found(&path));
        }
        Ok(())
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let PathArgs { path } = parse_args(self.name(), args)?;
        let mut tree = self.tree.inner.write().await;
        if path == ROOT || !tree.contains_key(&path) {
            return Err(not_found(&path));
        }
        let prefix = format!("{path}/");
        let before = tree.len();
        tree.retain(|k, _| k != &path && !k.starts_with(&prefix));
        Ok(ToolOutput::new(result(json!({
            "deleted": path,
            "removed": before - tree.len(),
        }))))
    }
}

// ---------- request_user_verification ----------

#[derive(Debug, Deserialize, JsonSchema)]
struct VerificationArgs {
    /// 请用户确认的问题
    question: String,
}

pub struct RequestUserVerificationTool;

#[async_trait]
impl Tool for RequestUserVerificationTool {
    fn name(&self) -> &str {
        "request_user_verification"
    }

    fn description(&self) -> &str {
        "Ask the user to verify the result in their environment. Args: {\"question\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<VerificationArgs>()
    }

    async fn execute(&self, args: &Args) -> Result<ToolOutput, ToolError> {
        let VerificationArgs { question } = parse_args(self.name(), args)?;
        Ok(ToolOutput::awaiting_feedback(
            question.clone(),
            result(json!({ "question": question })),
        ))
    }
}

/// 注册全部实例树工具
pub fn register_workspace_tools(
    registry: &mut ToolRegistry,
    tree: &InstanceTree,
) -> Result<(), AgentError> {
    registry.register(ReadInstanceTool::new(tree.clone()))?;
    registry.register(ReadScriptTool::new(tree.clone()))?;
    registry.register(CreateInstanceTool::new(tree.clone()))?;
    registry.register(SetPropertyTool::new(tree.clone()))?;
    registry.register(EditScriptTool::new(tree.clone()))?;
    registry.register(DeleteInstanceTool::new(tree.clone()))?;
    registry.register(RequestUserVerificationTool)?;
    Ok(())
}
