//! Folding a run's event stream into a single result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tideloop_core::message::{Message, Thread};
use tideloop_core::provider::Usage;

use crate::engine::RunHandle;
use crate::error::EngineError;
use crate::event::ExecutionEvent;
use crate::stream::EventStream;

/// The outcome of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// The thread as it stood when the run concluded
    pub thread: Thread,

    /// Messages the run appended, in order
    pub new_messages: Vec<Message>,

    /// Streamed text, or the final reply when nothing was streamed
    pub final_text: Option<String>,

    /// Validated payload, when an output schema was supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,

    pub retry_count: u32,
    pub turns: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AgentResult {
    pub(crate) fn assemble(thread: Thread, start_len: usize, summary: RunSummary) -> Self {
        let new_messages = thread
            .messages
            .get(start_len..)
            .map(<[Message]>::to_vec)
            .unwrap_or_default();
        Self {
            thread,
            new_messages,
            final_text: summary.final_text,
            structured: summary.structured,
            retry_count: summary.retry_count,
            turns: summary.turns,
            usage: summary.usage,
        }
    }
}

/// Everything the event stream says about a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub final_text: Option<String>,
    pub structured: Option<Value>,
    pub retry_count: u32,
    pub turns: u32,
    pub usage: Option<Usage>,
}

/// Consumes events and remembers the outcome of the first terminal one.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    text: String,
    outcome: Option<Result<RunSummary, EngineError>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns true once a terminal event has been seen;
    /// anything after it is ignored.
    pub fn observe(&mut self, event: &ExecutionEvent) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match event {
            ExecutionEvent::ContentDelta { content } => self.text.push_str(content),
            ExecutionEvent::ExecutionComplete {
                content,
                structured,
                turns,
                retry_count,
                usage,
                ..
            } => {
                let final_text = if self.text.is_empty() {
                    content.clone()
                } else {
                    Some(std::mem::take(&mut self.text))
                };
                self.outcome = Some(Ok(RunSummary {
                    final_text,
                    structured: structured.clone(),
                    retry_count: *retry_count,
                    turns: *turns,
                    usage: usage.clone(),
                }));
            }
            ExecutionEvent::ExecutionError {
                failure,
                retry_count,
                ..
            } => {
                self.outcome = Some(Err(EngineError::from_failure(
                    failure.clone(),
                    *retry_count,
                )));
            }
            _ => {}
        }
        self.outcome.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// The run's outcome. A stream that ended without a terminal event is an
    /// internal error.
    pub fn finish(self) -> Result<RunSummary, EngineError> {
        self.outcome.unwrap_or_else(|| {
            Err(EngineError::Internal(
                "event stream ended before a terminal event".into(),
            ))
        })
    }

    /// Read `events` up to and including the terminal event.
    pub async fn drain(mut events: EventStream) -> Result<RunSummary, EngineError> {
        let mut aggregator = Self::new();
        while let Some(event) = events.next().await {
            if aggregator.observe(&event) {
                break;
            }
        }
        aggregator.finish()
    }

    /// Drain a spawned run and pair its summary with the returned thread.
    pub async fn collect(handle: RunHandle) -> Result<AgentResult, EngineError> {
        let RunHandle { events, task } = handle;
        let summary = Self::drain(events).await;
        let start_len = task.start_len();
        let thread = task.finish().await?;
        Ok(AgentResult::assemble(thread, start_len, summary?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionEngine;
    use crate::error::RunFailure;
    use crate::options::RunOptions;
    use crate::test_helpers::{ChunkedProvider, SequentialMockProvider, make_text_response};
    use std::sync::Arc;
    use tideloop_core::tool::ToolRegistry;

    fn complete(content: Option<&str>) -> ExecutionEvent {
        ExecutionEvent::ExecutionComplete {
            thread_id: "t".into(),
            content: content.map(str::to_string),
            structured: None,
            turns: 1,
            retry_count: 0,
            usage: None,
        }
    }

    fn delta(s: &str) -> ExecutionEvent {
        ExecutionEvent::ContentDelta { content: s.into() }
    }

    #[test]
    fn deltas_are_concatenated() {
        let mut agg = ResultAggregator::new();
        for e in [delta("Hel"), delta("lo"), complete(Some("Hello"))] {
            agg.observe(&e);
        }
        assert_eq!(agg.finish().unwrap().final_text.as_deref(), Some("Hello"));
    }

    #[test]
    fn terminal_content_used_when_nothing_streamed() {
        let mut agg = ResultAggregator::new();
        assert!(agg.observe(&complete(Some("whole"))));
        assert_eq!(agg.finish().unwrap().final_text.as_deref(), Some("whole"));
    }

    #[test]
    fn first_terminal_wins() {
        let mut agg = ResultAggregator::new();
        agg.observe(&ExecutionEvent::ExecutionError {
            thread_id: "t".into(),
            failure: RunFailure::Cancelled,
            turns: 0,
            retry_count: 0,
        });
        agg.observe(&complete(Some("late")));
        assert!(matches!(agg.finish(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn missing_terminal_is_internal_error() {
        let mut agg = ResultAggregator::new();
        agg.observe(&delta("partial"));
        assert!(!agg.is_finished());
        assert!(matches!(agg.finish(), Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn into_result_matches_blocking_run() {
        let tools = Arc::new(ToolRegistry::new());
        let streamed = ExecutionEngine::new(
            Arc::new(ChunkedProvider::new(vec![make_text_response("same answer")])),
            "mock-model",
            tools.clone(),
        );
        let blocking = ExecutionEngine::new(
            Arc::new(SequentialMockProvider::single_text("same answer")),
            "mock-model",
            tools,
        );

        let mut thread = Thread::new();
        thread.push(Message::user("q"));

        let a = streamed
            .run_stream(thread.clone(), RunOptions::new())
            .into_result()
            .await
            .unwrap();
        let b = blocking.run(&mut thread, RunOptions::new()).await.unwrap();

        assert_eq!(a.final_text, b.final_text);
        assert_eq!(a.new_messages.len(), b.new_messages.len());
        assert_eq!(a.thread.len(), thread.len());
    }
}
