//! Shared test helpers for engine, dispatcher and aggregator tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use tideloop_core::error::{ProviderError, ToolError};
use tideloop_core::message::{Message, MessageToolCall};
use tideloop_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use tideloop_core::tool::{Tool, ToolContext, ToolResult};

/// A mock provider that returns a sequence of scripted replies.
///
/// Each call to `complete` (or `stream`) takes the next reply in the queue
/// and records the request it was given. Panics if more calls are made than
/// replies provided.
pub struct SequentialMockProvider {
    replies: Vec<Result<ProviderResponse, ProviderError>>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::scripted(responses.into_iter().map(Ok).collect())
    }

    /// Replies that may include provider failures.
    pub fn scripted(replies: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a provider that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Create a provider that first returns tool calls, then a final answer.
    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, thought: &str, answer: &str) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, thought),
            make_text_response(answer),
        ])
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(n) {
            Some(reply) => reply.clone(),
            None => panic!(
                "SequentialMockProvider: no more responses (call #{n}, have {})",
                self.replies.len()
            ),
        }
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.next_reply(request)
    }
}

/// Streams each scripted reply word by word.
pub struct ChunkedProvider {
    inner: SequentialMockProvider,
}

impl ChunkedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            inner: SequentialMockProvider::new(responses),
        }
    }
}

#[async_trait]
impl Provider for ChunkedProvider {
    fn name(&self) -> &str {
        "chunked_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.inner.complete(request).await
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let response = self.inner.complete(request).await?;
        let words: Vec<String> = response
            .message
            .content
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let (tx, rx) =
            tokio::sync::mpsc::channel(words.len() + 2 * response.message.tool_calls.len() + 1);
        for word in words {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some(word),
                    ..Default::default()
                }))
                .await;
        }
        // Tool calls arrive split in two fragments sharing an id
        for tc in response.message.tool_calls {
            let mid = tc.arguments.len() / 2;
            let (head, tail) = tc.arguments.split_at(mid);
            for part in [head, tail] {
                let _ = tx
                    .send(Ok(StreamChunk {
                        tool_calls: vec![MessageToolCall {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            arguments: part.to_string(),
                        }],
                        ..Default::default()
                    }))
                    .await;
            }
        }
        let _ = tx
            .send(Ok(StreamChunk {
                done: true,
                usage: response.usage,
                ..Default::default()
            }))
            .await;
        Ok(rx)
    }
}

/// Always asks for the same tool, forever.
pub struct LoopingProvider;

#[async_trait]
impl Provider for LoopingProvider {
    fn name(&self) -> &str {
        "looping_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(make_tool_call_response(
            vec![make_tool_call("lookup", json!({"key": "again"}))],
            "",
        ))
    }
}

/// Waits before answering.
pub struct SlowProvider {
    pub delay: Duration,
}

#[async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(make_text_response("too late"))
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    let mut response = make_text_response(thought);
    response.message.tool_calls = tool_calls;
    response
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// Returns `value:<key>` for any key.
pub struct LookupTool;

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Look up a value by key"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "key": { "type": "string" } },
            "required": ["key"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let key = arguments["key"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'key'".into()))?;
        Ok(ToolResult::ok("", format!("value:{key}")))
    }
}

/// Needs a `tenant` in its context and counts how often it actually ran.
#[derive(Default)]
pub struct CountingContextTool {
    pub invocations: AtomicUsize,
}

#[async_trait]
impl Tool for CountingContextTool {
    fn name(&self) -> &str {
        "tenant_lookup"
    }

    fn description(&self) -> &str {
        "Reports the caller's tenant"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn requires_context(&self) -> bool {
        true
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::MissingContext(self.name().into()))
    }

    async fn execute_with_context(
        &self,
        context: ToolContext,
        _arguments: Value,
    ) -> Result<ToolResult, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let tenant: String = context.get_as("tenant").unwrap_or_default();
        Ok(ToolResult::ok("", format!("tenant={tenant}")))
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Never works"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "flaky".into(),
            reason: "upstream unavailable".into(),
        })
    }
}

/// Panics when called.
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        panic!("kaboom");
    }
}

/// Sleeps `ms` milliseconds, then returns `label`.
pub struct SleepyTool;

#[async_trait]
impl Tool for SleepyTool {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes a label"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ms": { "type": "integer" },
                "label": { "type": "string" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let label = arguments["label"].as_str().unwrap_or_default();
        Ok(ToolResult::ok("", label))
    }
}
