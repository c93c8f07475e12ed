//! Tool registry and tool contract.
//!
//! A tool owns a JSON-schema surface shown to the model and an async
//! effect. Input validation failures are returned to the model as tool
//! outputs, never raised at the engine; only unexpected I/O surfaces as
//! errors and the engine converts those into user-facing messages.

pub mod builtin;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{IntegrationsConfig, ToolsConfig};
use crate::engine::provider::ToolSpec;
use crate::session::Session;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A file delivered alongside an outbound message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Capability closures handed to tools. Each wraps the channel transport
/// for the session the tool runs in.
pub type SendFn = Arc<dyn Fn(String, Vec<Attachment>) -> BoxFuture<Result<(), String>> + Send + Sync>;
pub type ReactFn = Arc<dyn Fn(String, Option<String>) -> BoxFuture<Result<(), String>> + Send + Sync>;
pub type DownloadFn = Arc<dyn Fn(String) -> BoxFuture<Result<Vec<Attachment>, String>> + Send + Sync>;

/// JSON Schema property definition
#[derive(Debug, Clone, serde::Serialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: &'static str,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "string",
            description: description.into(),
            default: None,
            enum_values: None,
            items: None,
        }
    }

    pub fn integer(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "integer",
            description: description.into(),
            default: None,
            enum_values: None,
            items: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "boolean",
            description: description.into(),
            default: None,
            enum_values: None,
            items: None,
        }
    }

    pub fn string_array(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "array",
            description: description.into(),
            default: None,
            enum_values: None,
            items: Some(Box::new(PropertySchema::string(""))),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Tool input schema in JSON Schema object form.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ToolInputSchema {
    pub properties: HashMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl ToolInputSchema {
    pub fn new(
        properties: Vec<(&str, PropertySchema)>,
        required: Vec<&str>,
    ) -> Self {
        ToolInputSchema {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            required: required.into_iter().map(String::from).collect(),
        }
    }

    pub fn to_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

/// Tool definition shown to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

impl ToolDefinition {
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.to_parameters(),
        }
    }
}

/// Result of tool execution: a JSON object carrying at least `success`.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: Value,
}

impl ToolResult {
    /// Success output; `success: true` is added when absent.
    pub fn success(fields: Value) -> Self {
        let mut output = fields;
        if let Some(map) = output.as_object_mut() {
            map.entry("success").or_insert(json!(true));
        }
        ToolResult { output }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult {
            output: json!({"success": false, "error": message.into()}),
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: &str) -> Self {
        ToolResult {
            output: json!({"success": false, "error": message.into(), "code": code}),
        }
    }

    /// Schema mismatch on the tool's input.
    pub fn validation_error(err: &serde_json::Error) -> Self {
        ToolResult {
            output: json!({
                "success": false,
                "error": "Invalid parameters",
                "issues": [err.to_string()],
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.output
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Context a tool executes in: the session, the agent identity, and the
/// capability closures. Kept deliberately small.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_slug: String,
    pub agent_root: PathBuf,
    pub session: Arc<Mutex<Session>>,
    pub send: SendFn,
    pub react: Option<ReactFn>,
    pub download_attachments: Option<DownloadFn>,
    pub tools_config: ToolsConfig,
    pub integrations: IntegrationsConfig,
    pub scheduler: Option<Arc<crate::scheduler::Scheduler>>,
}

impl ToolContext {
    /// A context wired to a no-op transport, for tools that never send.
    #[cfg(test)]
    pub fn noop(
        agent_root: PathBuf,
        session: Arc<Mutex<Session>>,
    ) -> Self {
        ToolContext {
            agent_slug: "test".to_string(),
            agent_root,
            session,
            send: Arc::new(|_, _| Box::pin(async { Ok(()) })),
            react: None,
            download_attachments: None,
            tools_config: ToolsConfig::default(),
            integrations: IntegrationsConfig::default(),
            scheduler: None,
        }
    }
}

/// Trait that all tools implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool definition for the provider API
    fn definition(&self) -> ToolDefinition;

    /// Executes the tool with the given parameters
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;

    fn name(&self) -> String {
        self.definition().name
    }
}

/// Registry that holds all available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions visible to the model, filtered by the agent's tool
    /// config, in stable name order.
    pub fn visible_definitions(&self, config: &ToolsConfig) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| config.is_enabled(&t.name()))
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name. Unknown or disabled tools come back as
    /// structured errors the model can read.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolResult {
        let tool = match self.get(name) {
            Some(t) => t,
            None => return ToolResult::error(format!("Tool '{}' not found", name)),
        };
        if !ctx.tools_config.is_enabled(name) {
            return ToolResult::error(format!("Tool '{}' is disabled", name));
        }
        tool.execute(params, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the standard registry with every built-in tool.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(builtin::respond::RespondTool));
    registry.register(Arc::new(builtin::respond::NoResponseTool));
    registry.register(Arc::new(builtin::read::ReadTool));
    registry.register(Arc::new(builtin::files::OpenFileTool));
    registry.register(Arc::new(builtin::files::CloseFileTool));
    registry.register(Arc::new(builtin::files::ListDirTool));
    registry.register(Arc::new(builtin::files::WriteTool));
    registry.register(Arc::new(builtin::files::StrReplaceTool));
    registry.register(Arc::new(builtin::search::BraveSearchTool));
    registry.register(Arc::new(builtin::skill::ReadSkillTool));
    registry.register(Arc::new(builtin::exec::ExecTool));
    registry.register(Arc::new(builtin::schedule::ScheduleTool));
    registry.register(Arc::new(builtin::session_info::SessionInfoTool));
    registry
}
