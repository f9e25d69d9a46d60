//! A tool that hands a subtask to another engine.
//!
//! The nested run gets a fresh thread holding only the task text, so the
//! parent's history never leaks into it. Whatever the nested run produces
//! comes back as an ordinary tool result.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use tideloop_core::error::ToolError;
use tideloop_core::message::{Message, Thread};
use tideloop_core::tool::{Tool, ToolContext, ToolResult};

use crate::engine::ExecutionEngine;
use crate::options::RunOptions;

pub struct DelegateTool {
    name: String,
    description: String,
    engine: ExecutionEngine,
    options: RunOptions,
    forward_context: bool,
}

impl DelegateTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        engine: ExecutionEngine,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            engine,
            options: RunOptions::new(),
            forward_context: false,
        }
    }

    /// Options for every nested run (schema, retry policy).
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Pass the caller's context through to the nested run's tools.
    pub fn forwarding_context(mut self) -> Self {
        self.forward_context = true;
        self
    }

    async fn delegate(&self, options: RunOptions, arguments: Value) -> Result<ToolResult, ToolError> {
        let task = arguments["task"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments(format!("{}: missing 'task'", self.name)))?;

        let mut thread = Thread::new();
        thread.push(Message::user(task));
        debug!(tool = %self.name, thread_id = %thread.id, "Delegating subtask");

        let result = self
            .engine
            .run(&mut thread, options)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let mut output = ToolResult::ok("", result.final_text.unwrap_or_default());
        output.data = result.structured;
        Ok(output)
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the delegate should do, stated in full"
                }
            },
            "required": ["task"]
        })
    }

    fn requires_context(&self) -> bool {
        self.forward_context
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        self.delegate(self.options.clone(), arguments).await
    }

    async fn execute_with_context(
        &self,
        context: ToolContext,
        arguments: Value,
    ) -> Result<ToolResult, ToolError> {
        self.delegate(self.options.clone().with_context(context), arguments)
            .await
    }
}
