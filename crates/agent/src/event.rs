//! Execution events.
//!
//! `ExecutionEvent` is the only thing the loop produces. Consumers (the
//! result aggregator, the protocol adapter, observers) decide what to do with
//! it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tideloop_core::provider::Usage;

use crate::error::RunFailure;
use crate::validator::FieldError;

/// Events emitted during a run, in causal order.
///
/// Exactly one terminal event (`execution_complete` or `execution_error`)
/// ends every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A new turn is about to call the completion client.
    TurnStarted { turn: u32 },

    /// Partial text from the model.
    ContentDelta { content: String },

    /// A tool call is about to be dispatched.
    ToolCallStarted {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool call produced a result.
    ToolCallCompleted {
        id: String,
        name: String,
        output: String,
        duration_ms: u64,
    },

    /// A tool call failed; the failure was fed back to the model.
    ToolCallFailed {
        id: String,
        name: String,
        error: String,
        duration_ms: u64,
    },

    /// The reply did not satisfy the output schema.
    ValidationFailed {
        attempt: u32,
        errors: Vec<FieldError>,
    },

    /// The run finished successfully.
    ExecutionComplete {
        thread_id: String,
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<serde_json::Value>,
        turns: u32,
        retry_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The run ended without completing.
    ExecutionError {
        thread_id: String,
        failure: RunFailure,
        turns: u32,
        retry_count: u32,
    },
}

impl ExecutionEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::ContentDelta { .. } => "content_delta",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::ToolCallFailed { .. } => "tool_call_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ExecutionComplete { .. } => "execution_complete",
            Self::ExecutionError { .. } => "execution_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionComplete { .. } | Self::ExecutionError { .. }
        )
    }
}

/// Per-run hook invoked synchronously at every emission, before the event
/// reaches any subscriber. Keep implementations cheap.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::TurnStarted { turn } => debug!(turn, "turn started"),
            ExecutionEvent::ContentDelta { content } => {
                debug!(bytes = content.len(), "content delta")
            }
            ExecutionEvent::ToolCallStarted { id, name, .. } => {
                debug!(call_id = %id, tool = %name, "tool call started")
            }
            ExecutionEvent::ToolCallCompleted {
                id,
                name,
                duration_ms,
                ..
            } => debug!(call_id = %id, tool = %name, duration_ms, "tool call completed"),
            ExecutionEvent::ToolCallFailed {
                id,
                name,
                error,
                duration_ms,
            } => warn!(call_id = %id, tool = %name, duration_ms, error = %error, "tool call failed"),
            ExecutionEvent::ValidationFailed { attempt, errors } => {
                warn!(attempt, errors = errors.len(), "structured output rejected")
            }
            ExecutionEvent::ExecutionComplete {
                thread_id,
                turns,
                retry_count,
                ..
            } => info!(thread_id = %thread_id, turns, retry_count, "run complete"),
            ExecutionEvent::ExecutionError {
                thread_id,
                failure,
                turns,
                ..
            } => warn!(thread_id = %thread_id, turns, failure = %failure, "run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn event_serialization_delta() {
        let event = ExecutionEvent::ContentDelta {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"content_delta""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn event_serialization_error_nests_failure() {
        let event = ExecutionEvent::ExecutionError {
            thread_id: "t1".into(),
            failure: RunFailure::IterationLimitExceeded { max_turns: 2 },
            turns: 2,
            retry_count: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_error");
        assert_eq!(json["failure"]["kind"], "iteration_limit_exceeded");
        let back: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn complete_omits_missing_structured_payload() {
        let event = ExecutionEvent::ExecutionComplete {
            thread_id: "t1".into(),
            content: Some("4".into()),
            structured: None,
            turns: 1,
            retry_count: 0,
            usage: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("structured"));
    }

    #[test]
    fn terminal_events() {
        assert!(!ExecutionEvent::TurnStarted { turn: 1 }.is_terminal());
        assert!(ExecutionEvent::ExecutionError {
            thread_id: "t".into(),
            failure: RunFailure::Cancelled,
            turns: 0,
            retry_count: 0,
        }
        .is_terminal());
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            ExecutionEvent::TurnStarted { turn: 1 },
            ExecutionEvent::ToolCallStarted {
                id: "a".into(),
                name: "b".into(),
                arguments: serde_json::Value::Null,
            },
            ExecutionEvent::ValidationFailed {
                attempt: 1,
                errors: vec![],
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn closures_are_observers() {
        let seen = Mutex::new(Vec::new());
        let observer = |e: &ExecutionEvent| seen.lock().unwrap().push(e.event_type());
        observer.on_event(&ExecutionEvent::TurnStarted { turn: 1 });
        TracingObserver.on_event(&ExecutionEvent::TurnStarted { turn: 1 });
        assert_eq!(*seen.lock().unwrap(), vec!["turn_started"]);
    }
}
