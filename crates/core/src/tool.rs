//! Tool traits and the registry of tool descriptors.
//!
//! Tools come in two flavours: async tools implementing [`Tool`] and
//! synchronous tools implementing [`BlockingTool`]. Registration inspects each
//! tool once and stores a [`ToolDescriptor`]; dispatch only ever looks at the
//! descriptor.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use crate::error::ToolError;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;

/// A request to execute a tool, with arguments already parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Parse the raw tool call emitted by the model.
    ///
    /// Empty argument strings are treated as `{}`.
    pub fn parse(raw: &MessageToolCall) -> Result<Self, ToolError> {
        let arguments = if raw.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&raw.arguments).map_err(|e| {
                ToolError::InvalidArguments(format!("{}: {e}", raw.name))
            })?
        };
        Ok(Self {
            id: raw.id.clone(),
            name: raw.name.clone(),
            arguments,
        })
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool considers the call successful
    pub success: bool,

    /// The output content fed back to the model
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// Caller-supplied runtime dependencies for tools that ask for them.
///
/// The map is immutable once shared: every concurrent call in a turn gets
/// its own cheap clone of the same read-only view. Values are never printed,
/// so a context can't leak into logs through `Debug`.
#[derive(Clone, Default)]
pub struct ToolContext {
    values: Arc<HashMap<String, serde_json::Value>>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            values: Arc::new(map.into_iter().collect()),
        }
    }

    /// Add a value. Only meaningful while the context is being built.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Deserialize a value into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("ToolContext")
            .field("keys", &keys)
            .field("values", &"[REDACTED]")
            .finish()
    }
}

/// An async tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "lookup").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether the tool needs a [`ToolContext`] injected ahead of its
    /// arguments. Read once at registration.
    fn requires_context(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError>;

    /// Execute with the caller's context. Tools that declare
    /// `requires_context` override this; the default ignores the context.
    async fn execute_with_context(
        &self,
        _context: ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        self.execute(arguments).await
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A synchronous tool. Runs on the blocking thread pool so it cannot stall
/// sibling calls in the same turn.
pub trait BlockingTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> serde_json::Value;

    fn requires_context(&self) -> bool {
        false
    }

    fn call(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError>;

    fn call_with_context(
        &self,
        _context: ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        self.call(arguments)
    }
}

/// How a registered tool is invoked.
#[derive(Clone)]
pub enum ToolInvoker {
    Async(Arc<dyn Tool>),
    Blocking(Arc<dyn BlockingTool>),
}

/// Everything the dispatcher needs to know about a tool, captured once at
/// registration.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub definition: ToolDefinition,
    pub requires_context: bool,
    pub invoker: ToolInvoker,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.invoker {
            ToolInvoker::Async(_) => "async",
            ToolInvoker::Blocking(_) => "blocking",
        };
        f.debug_struct("ToolDescriptor")
            .field("name", &self.definition.name)
            .field("requires_context", &self.requires_context)
            .field("invoker", &kind)
            .finish()
    }
}

/// A registry of available tools, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
    /// Registration order, so definitions reach the model deterministically
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = ToolDescriptor {
            definition: tool.to_definition(),
            requires_context: tool.requires_context(),
            invoker: ToolInvoker::Async(tool),
        };
        self.insert(descriptor);
    }

    /// Register a synchronous tool. Replaces any existing tool with the same name.
    pub fn register_blocking(&mut self, tool: Arc<dyn BlockingTool>) {
        let descriptor = ToolDescriptor {
            definition: ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            },
            requires_context: tool.requires_context(),
            invoker: ToolInvoker::Blocking(tool),
        };
        self.insert(descriptor);
    }

    fn insert(&mut self, descriptor: ToolDescriptor) {
        let name = descriptor.definition.name.clone();
        if self.tools.insert(name.clone(), descriptor).is_none() {
            self.order.push(name);
        }
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Tool definitions in registration order (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|d| d.definition.clone())
            .collect()
    }

    /// List all registered tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
