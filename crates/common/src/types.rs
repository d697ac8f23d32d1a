// Core domain records shared by the execution core and its embedders.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key/value arguments and settings are plain JSON objects.
pub type JsonMap = Map<String, Value>;

/// Tenant isolation key. Every entity, cache entry and event stream is scoped by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(String);

impl Partition {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Partition {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Partition {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpType {
    Tool,
    Resource,
    Prompt,
}

impl McpType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tool" => Some(Self::Tool),
            "resource" => Some(Self::Resource),
            "prompt" => Some(Self::Prompt),
            _ => None,
        }
    }
}

impl fmt::Display for McpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Modules and settings ───────────────────────────────────────────

/// One class exported by a module bundle, optionally bound to a setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleClass {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting_id: Option<String>,
}

/// A deployable code bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpModule {
    pub partition: Partition,
    pub module_name: String,
    pub package_name: String,
    #[serde(default)]
    pub classes: Vec<ModuleClass>,
    /// Blob URI of the bundle archive.
    #[serde(default)]
    pub source_uri: Option<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl McpModule {
    pub fn class(&self, class_name: &str) -> Option<&ModuleClass> {
        self.classes.iter().find(|class| class.class_name == class_name)
    }

    /// Every setting referenced by this module's classes.
    pub fn setting_ids(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().filter_map(|class| class.setting_id.as_deref())
    }
}

/// Per-class configuration handed to a unit at instantiation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpSetting {
    pub partition: Partition,
    pub setting_id: String,
    #[serde(default)]
    pub setting: JsonMap,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

// ── Functions ──────────────────────────────────────────────────────

/// A callable tool, resource or prompt.
///
/// `module_name` is a soft reference: a dangling name is only detected when
/// the function is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpFunction {
    pub partition: Partition,
    pub name: String,
    pub mcp_type: McpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default = "default_return_type")]
    pub return_type: String,
    /// `inputSchema` for tools, `arguments` for prompts, `uri`/`mimeType` for resources.
    #[serde(default)]
    pub schema: JsonMap,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

fn default_return_type() -> String {
    "text".to_string()
}

impl McpFunction {
    /// The (module, class) binding, when the function is module-backed.
    pub fn binding(&self) -> Option<(&str, &str)> {
        match (self.module_name.as_deref(), self.class_name.as_deref()) {
            (Some(module), Some(class)) if !module.is_empty() && !class.is_empty() => {
                Some((module, class))
            }
            _ => None,
        }
    }

    /// The name the unit exports this function under.
    pub fn entry_point(&self) -> &str {
        self.function_name.as_deref().unwrap_or(&self.name)
    }

    pub fn resource_uri(&self) -> Option<&str> {
        self.schema.get("uri").and_then(Value::as_str)
    }
}

// ── Calls ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initial,
    InProcess,
    Completed,
    Failed,
}

impl CallStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::InProcess => "in_process",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "in_process" => Some(Self::InProcess),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `initial → in_process → completed | failed`. A call that never reaches
    /// a worker may fail straight from `initial`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initial, Self::InProcess)
                | (Self::Initial, Self::Failed)
                | (Self::InProcess, Self::Completed)
                | (Self::InProcess, Self::Failed)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    Validation,
    Execution,
    Timeout,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
        }
    }
}

/// One execution instance of a function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpFunctionCall {
    pub partition: Partition,
    pub call_uuid: Uuid,
    pub name: String,
    pub mcp_type: McpType,
    #[serde(default)]
    pub arguments: JsonMap,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Blob URI holding the content when it was too large to store inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(default)]
    pub content_externalized: bool,
    /// Wall-clock execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl McpFunctionCall {
    pub fn new(partition: Partition, name: impl Into<String>, mcp_type: McpType, arguments: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            partition,
            call_uuid: Uuid::new_v4(),
            name: name.into(),
            mcp_type,
            arguments,
            status: CallStatus::Initial,
            content: None,
            content_ref: None,
            content_externalized: false,
            time_spent_ms: None,
            error: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a transport hands to the engine for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundRequest {
    pub partition: Partition,
    pub mcp_type: McpType,
    pub name: String,
    #[serde(default)]
    pub arguments: JsonMap,
    /// Collapses duplicate submissions while the first call is still pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl InboundRequest {
    pub fn new(partition: impl Into<Partition>, mcp_type: McpType, name: impl Into<String>, arguments: JsonMap) -> Self {
        Self {
            partition: partition.into(),
            mcp_type,
            name: name.into(),
            arguments,
            dedupe_key: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}
