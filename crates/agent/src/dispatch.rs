//! Tool dispatch.
//!
//! The dispatcher is the boundary between the loop and tool code: whatever a
//! tool does (error, bad arguments, panic), the loop gets back a
//! [`ToolOutcome`] and nothing else.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use tracing::{debug, warn};

use tideloop_core::error::ToolError;
use tideloop_core::message::MessageToolCall;
use tideloop_core::provider::ToolDefinition;
use tideloop_core::tool::{ToolCall, ToolContext, ToolInvoker, ToolRegistry, ToolResult};

/// What happened to one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Result<ToolResult, ToolError>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    /// True when the tool ran and reported success.
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(r) if r.success)
    }

    /// The text fed back to the model as the tool-result message.
    pub fn content(&self) -> String {
        match &self.result {
            Ok(r) => r.output.clone(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Resolves and runs tool calls against a registry built at startup.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Definitions advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Run one call. Never fails; errors are captured in the outcome.
    pub async fn dispatch(&self, call: &MessageToolCall, context: Option<ToolContext>) -> ToolOutcome {
        let start = Instant::now();
        let result = self.invoke(call, context).await.map(|mut r| {
            r.call_id = call.id.clone();
            r
        });
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(r) => debug!(
                tool = %call.name,
                call_id = %call.id,
                success = r.success,
                duration_ms,
                "Tool executed"
            ),
            Err(e) => warn!(
                tool = %call.name,
                call_id = %call.id,
                duration_ms,
                error = %e,
                "Tool execution failed"
            ),
        }

        ToolOutcome {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            duration_ms,
        }
    }

    /// Run every call of a turn concurrently. Outcomes come back in issue
    /// order regardless of which call finishes first; each call gets its own
    /// view of the context.
    pub async fn dispatch_all(
        &self,
        calls: &[MessageToolCall],
        context: Option<&ToolContext>,
    ) -> Vec<ToolOutcome> {
        join_all(calls.iter().map(|call| self.dispatch(call, context.cloned()))).await
    }

    async fn invoke(
        &self,
        raw: &MessageToolCall,
        context: Option<ToolContext>,
    ) -> Result<ToolResult, ToolError> {
        let descriptor = self.registry.resolve(&raw.name)?;

        let context = if descriptor.requires_context {
            Some(context.ok_or_else(|| ToolError::MissingContext(raw.name.clone()))?)
        } else {
            None
        };

        let ToolCall {
            name, arguments, ..
        } = ToolCall::parse(raw)?;

        match &descriptor.invoker {
            ToolInvoker::Async(tool) => {
                let tool = tool.clone();
                let run = async move {
                    match context {
                        Some(ctx) => tool.execute_with_context(ctx, arguments).await,
                        None => tool.execute(arguments).await,
                    }
                };
                AssertUnwindSafe(run)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(ToolError::Panicked {
                            tool_name: name,
                            reason: panic_message(payload.as_ref()),
                        })
                    })
            }
            ToolInvoker::Blocking(tool) => {
                let tool = tool.clone();
                let handle = tokio::task::spawn_blocking(move || match context {
                    Some(ctx) => tool.call_with_context(ctx, arguments),
                    None => tool.call(arguments),
                });
                match handle.await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_panic() => Err(ToolError::Panicked {
                        tool_name: name,
                        reason: panic_message(join_err.into_panic().as_ref()),
                    }),
                    Err(join_err) => Err(ToolError::ExecutionFailed {
                        tool_name: name,
                        reason: join_err.to_string(),
                    }),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
