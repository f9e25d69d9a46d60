//! The execution loop.
//!
//! One run drives a thread through repeated completion turns: stream or
//! complete, dispatch any tool calls, feed results back, validate structured
//! output and retry with a corrective message when it doesn't match. Every
//! step is reported as an [`ExecutionEvent`]; exactly one terminal event ends
//! the run.
//!
//! Three entry points share the same loop:
//!
//! - [`ExecutionEngine::run`] blocks until the run concludes and returns an
//!   [`AgentResult`], mutating the caller's thread in place.
//! - [`ExecutionEngine::run_stream`] spawns the run and hands back its event
//!   stream together with a [`RunTask`].
//! - [`ExecutionEngine::start`] spawns the run against a caller-built
//!   [`EventHub`], for consumers that need several subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tideloop_config::EngineConfig;
use tideloop_core::message::{Message, MessageToolCall, Thread};
use tideloop_core::provider::{Provider, ProviderRequest, ResponseFormat, ToolDefinition, Usage};
use tideloop_core::tool::ToolRegistry;

use crate::aggregator::{AgentResult, ResultAggregator};
use crate::dispatch::ToolDispatcher;
use crate::error::{EngineError, RunFailure};
use crate::event::ExecutionEvent;
use crate::options::RunOptions;
use crate::stream::{EventHub, EventSink, EventStream};
use crate::validator::{StructuredOutputValidator, corrective_message};

/// Cooperative cancellation for a run.
///
/// The loop checks the flag before every turn and after every await on the
/// completion client or tools; work finished after cancellation is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A spawned run. Resolves to the thread once the run has concluded.
pub struct RunTask {
    join: JoinHandle<Thread>,
    cancel: CancelHandle,
    start_len: usize,
}

impl RunTask {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Number of messages the thread held when the run started.
    pub fn start_len(&self) -> usize {
        self.start_len
    }

    /// Wait for the run and take the thread back.
    pub async fn finish(self) -> Result<Thread, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))
    }
}

/// A spawned run together with its event stream.
pub struct RunHandle {
    pub events: EventStream,
    pub task: RunTask,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Consume the stream and assemble the final result.
    pub async fn into_result(self) -> Result<AgentResult, EngineError> {
        ResultAggregator::collect(self).await
    }
}

/// The reply of one completion turn, however it was obtained.
#[derive(Default)]
struct Reply {
    content: String,
    tool_calls: Vec<MessageToolCall>,
    usage: Option<Usage>,
}

/// Counters that end up on the terminal event.
#[derive(Default)]
struct RunState {
    turns: u32,
    retry_count: u32,
    usage: Option<Usage>,
}

impl RunState {
    fn add_usage(&mut self, usage: Usage) {
        let total = self.usage.get_or_insert_with(Usage::default);
        total.prompt_tokens += usage.prompt_tokens;
        total.completion_tokens += usage.completion_tokens;
        total.total_tokens += usage.total_tokens;
    }
}

struct Completion {
    content: String,
    structured: Option<serde_json::Value>,
}

/// Drives threads through the completion client and the tool registry.
///
/// Cheap to clone; clones share the provider and the registry.
#[derive(Clone)]
pub struct ExecutionEngine {
    provider: Arc<dyn Provider>,
    dispatcher: ToolDispatcher,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
    max_turns: u32,
    completion_timeout: Option<Duration>,
    event_buffer: usize,
}

impl ExecutionEngine {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            dispatcher: ToolDispatcher::new(tools),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: None,
            max_turns: 25,
            completion_timeout: None,
            event_buffer: 128,
        }
    }

    /// Build an engine from the `[engine]` section of a config.
    pub fn from_config(
        config: &EngineConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let settings = &config.engine;
        let mut engine = Self::new(provider, settings.model.clone(), tools)
            .with_temperature(settings.temperature)
            .with_max_turns(settings.max_turns)
            .with_event_buffer(settings.event_buffer);
        engine.max_tokens = settings.max_tokens;
        engine.system_prompt = settings.system_prompt.clone();
        engine.completion_timeout = settings.completion_timeout();
        engine
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Prepended to every request; never written into the thread.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the iteration ceiling.
    pub fn with_max_turns(mut self, max: u32) -> Self {
        self.max_turns = max.max(1);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// A hub sized for this engine's event buffer.
    pub fn event_hub(&self) -> EventHub {
        EventHub::new(self.event_buffer)
    }

    /// Run to completion, appending to `thread` as the run progresses.
    pub async fn run(
        &self,
        thread: &mut Thread,
        options: RunOptions,
    ) -> Result<AgentResult, EngineError> {
        self.run_with_cancel(thread, options, CancelHandle::new()).await
    }

    /// Like [`run`](Self::run), cancellable through `cancel`.
    pub async fn run_with_cancel(
        &self,
        thread: &mut Thread,
        options: RunOptions,
        cancel: CancelHandle,
    ) -> Result<AgentResult, EngineError> {
        let start_len = thread.len();
        let mut hub = self.event_hub();
        let events = hub.subscribe();
        let sink = hub.into_sink(options.observers.clone());

        let ((), summary) = tokio::join!(
            self.drive(thread, options, sink, cancel),
            ResultAggregator::drain(events)
        );

        Ok(AgentResult::assemble(thread.clone(), start_len, summary?))
    }

    /// Spawn a run and return its event stream.
    pub fn run_stream(&self, thread: Thread, options: RunOptions) -> RunHandle {
        let mut hub = self.event_hub();
        let events = hub.subscribe();
        let task = self.start(thread, options, hub);
        RunHandle { events, task }
    }

    /// Spawn a run whose events go to every subscriber of `hub`.
    pub fn start(&self, mut thread: Thread, options: RunOptions, hub: EventHub) -> RunTask {
        let engine = self.clone();
        let cancel = CancelHandle::new();
        let token = cancel.clone();
        let start_len = thread.len();
        let sink = hub.into_sink(options.observers.clone());

        let join = tokio::spawn(async move {
            engine.drive(&mut thread, options, sink, token).await;
            thread
        });

        RunTask {
            join,
            cancel,
            start_len,
        }
    }

    async fn drive(
        &self,
        thread: &mut Thread,
        options: RunOptions,
        mut sink: EventSink,
        cancel: CancelHandle,
    ) {
        let thread_id = thread.id.to_string();
        info!(
            thread_id = %thread_id,
            messages = thread.len(),
            structured = options.schema.is_some(),
            "Starting run"
        );

        let mut state = RunState::default();
        let outcome = self
            .turns(thread, &options, &mut sink, &cancel, &mut state)
            .await;

        let terminal = match outcome {
            Ok(done) => {
                info!(
                    thread_id = %thread_id,
                    turns = state.turns,
                    retry_count = state.retry_count,
                    "Run complete"
                );
                ExecutionEvent::ExecutionComplete {
                    thread_id,
                    content: Some(done.content),
                    structured: done.structured,
                    turns: state.turns,
                    retry_count: state.retry_count,
                    usage: state.usage,
                }
            }
            Err(failure) => {
                warn!(
                    thread_id = %thread_id,
                    turns = state.turns,
                    failure = %failure,
                    "Run failed"
                );
                ExecutionEvent::ExecutionError {
                    thread_id,
                    failure,
                    turns: state.turns,
                    retry_count: state.retry_count,
                }
            }
        };
        sink.emit(terminal).await;
        debug!(events = sink.emitted(), "Run events delivered");
    }

    async fn turns(
        &self,
        thread: &mut Thread,
        options: &RunOptions,
        sink: &mut EventSink,
        cancel: &CancelHandle,
        state: &mut RunState,
    ) -> Result<Completion, RunFailure> {
        let validator = match &options.schema {
            Some(schema) => Some(StructuredOutputValidator::new(&schema.schema).map_err(
                |e| RunFailure::InvalidSchema {
                    reason: e.to_string(),
                },
            )?),
            None => None,
        };
        let response_format = options.schema.as_ref().map(|s| s.response_format());
        let tools = self.dispatcher.definitions();

        loop {
            if cancel.is_cancelled() {
                return Err(RunFailure::Cancelled);
            }
            if state.turns >= self.max_turns {
                warn!(max_turns = self.max_turns, "Iteration ceiling reached");
                return Err(RunFailure::IterationLimitExceeded {
                    max_turns: self.max_turns,
                });
            }
            state.turns += 1;
            debug!(turn = state.turns, "Execution loop turn");
            sink.emit(ExecutionEvent::TurnStarted { turn: state.turns })
                .await;

            let request = self.build_request(thread, &tools, response_format.clone());
            let reply = if validator.is_some() {
                self.complete(request).await?
            } else {
                self.stream(request, sink).await?
            };
            if let Some(usage) = reply.usage.clone() {
                state.add_usage(usage);
            }
            if cancel.is_cancelled() {
                debug!("Discarding reply of cancelled run");
                return Err(RunFailure::Cancelled);
            }

            // ── Tool calls: dispatch, record, go round again ──
            if !reply.tool_calls.is_empty() {
                for tc in &reply.tool_calls {
                    sink.emit(ExecutionEvent::ToolCallStarted {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        arguments: serde_json::from_str(&tc.arguments)
                            .unwrap_or_else(|_| serde_json::Value::String(tc.arguments.clone())),
                    })
                    .await;
                }

                let outcomes = self
                    .dispatcher
                    .dispatch_all(&reply.tool_calls, options.context.as_ref())
                    .await;
                if cancel.is_cancelled() {
                    debug!("Discarding tool results of cancelled run");
                    return Err(RunFailure::Cancelled);
                }

                thread.push(Message::assistant_with_tool_calls(
                    reply.content,
                    reply.tool_calls,
                ));
                for outcome in outcomes {
                    let content = outcome.content();
                    thread.push(Message::tool_result(&outcome.call_id, &content));
                    let event = if outcome.is_success() {
                        ExecutionEvent::ToolCallCompleted {
                            id: outcome.call_id,
                            name: outcome.name,
                            output: content,
                            duration_ms: outcome.duration_ms,
                        }
                    } else {
                        ExecutionEvent::ToolCallFailed {
                            id: outcome.call_id,
                            name: outcome.name,
                            error: content,
                            duration_ms: outcome.duration_ms,
                        }
                    };
                    sink.emit(event).await;
                }
                continue;
            }

            thread.push(Message::assistant(&reply.content));

            let Some(validator) = &validator else {
                return Ok(Completion {
                    content: reply.content,
                    structured: None,
                });
            };

            // ── Structured output: validate, retry with corrections ──
            match validator.validate_text(&reply.content) {
                Ok(value) => {
                    sink.emit(ExecutionEvent::ContentDelta {
                        content: reply.content.clone(),
                    })
                    .await;
                    return Ok(Completion {
                        content: reply.content,
                        structured: Some(value),
                    });
                }
                Err(errors) => {
                    warn!(
                        attempt = state.retry_count + 1,
                        errors = errors.len(),
                        "Structured output failed validation"
                    );
                    sink.emit(ExecutionEvent::ValidationFailed {
                        attempt: state.retry_count + 1,
                        errors: errors.clone(),
                    })
                    .await;

                    thread.push(Message::user(corrective_message(&errors)));
                    if state.retry_count >= options.retry.max_retries() {
                        return Err(RunFailure::SchemaValidationExhausted {
                            errors,
                            last_payload: reply.content,
                        });
                    }
                    state.retry_count += 1;

                    let delay = options.retry.backoff_for(state.retry_count);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn build_request(
        &self,
        thread: &Thread,
        tools: &[ToolDefinition],
        response_format: Option<ResponseFormat>,
    ) -> ProviderRequest {
        let mut messages = Vec::with_capacity(thread.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt));
        }
        messages.extend(thread.messages.iter().cloned());

        ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
            stream: response_format.is_none(),
            response_format,
        }
    }

    async fn complete(&self, request: ProviderRequest) -> Result<Reply, RunFailure> {
        let mut budget = TurnBudget::new(self.completion_timeout);
        let response = budget
            .wait(self.provider.complete(request))
            .await?
            .map_err(|error| RunFailure::Provider { error })?;
        Ok(Reply {
            content: response.message.content,
            tool_calls: response.message.tool_calls,
            usage: response.usage,
        })
    }

    /// Stream one turn, forwarding text deltas as they arrive.
    ///
    /// Only waits on the provider count against the completion timeout;
    /// time spent delivering events to slow subscribers does not.
    async fn stream(
        &self,
        request: ProviderRequest,
        sink: &mut EventSink,
    ) -> Result<Reply, RunFailure> {
        let mut budget = TurnBudget::new(self.completion_timeout);
        let mut rx = budget
            .wait(self.provider.stream(request))
            .await?
            .map_err(|error| RunFailure::Provider { error })?;
        let mut reply = Reply::default();

        while let Some(chunk) = budget.wait(rx.recv()).await? {
            let chunk = chunk.map_err(|error| RunFailure::Provider { error })?;
            if let Some(text) = chunk.content
                && !text.is_empty()
            {
                reply.content.push_str(&text);
                sink.emit(ExecutionEvent::ContentDelta { content: text })
                    .await;
            }

            // Merge tool call fragments that share an id
            for tc in chunk.tool_calls {
                if let Some(existing) = reply.tool_calls.iter_mut().find(|t| t.id == tc.id) {
                    existing.arguments.push_str(&tc.arguments);
                } else {
                    reply.tool_calls.push(tc);
                }
            }

            if chunk.usage.is_some() {
                reply.usage = chunk.usage;
            }
        }
        Ok(reply)
    }
}

/// What is left of a turn's completion timeout.
struct TurnBudget {
    limit: Option<Duration>,
    remaining: Option<Duration>,
}

impl TurnBudget {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }

    /// Await a provider future, charging the time it takes to the budget.
    async fn wait<T>(&mut self, call: impl Future<Output = T>) -> Result<T, RunFailure> {
        let (Some(limit), Some(remaining)) = (self.limit, self.remaining) else {
            return Ok(call.await);
        };
        let started = Instant::now();
        let out = tokio::time::timeout(remaining, call)
            .await
            .map_err(|_| RunFailure::CompletionTimeout {
                timeout_ms: limit.as_millis() as u64,
            })?;
        self.remaining = Some(remaining.saturating_sub(started.elapsed()));
        Ok(out)
    }
}
