//! The Tideloop execution engine.
//!
//! A run follows a **complete → act → observe** cycle:
//!
//! 1. **Send** the thread to the completion client, streaming text as it arrives
//! 2. **If tool calls**: dispatch them concurrently, append the results, loop back
//! 3. **If an output schema is set**: validate the reply; on failure append a
//!    corrective message and loop back, up to the retry limit
//! 4. **Otherwise**: finish
//!
//! Everything that happens is emitted as an [`ExecutionEvent`]. Callers either
//! consume the events directly ([`ExecutionEngine::run_stream`]) or let the
//! [`ResultAggregator`] fold them into an [`AgentResult`]
//! ([`ExecutionEngine::run`]).

pub mod aggregator;
pub mod delegate;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod options;
pub mod stream;
pub mod validator;

#[cfg(test)]
mod test_helpers;

pub use aggregator::{AgentResult, ResultAggregator, RunSummary};
pub use delegate::DelegateTool;
pub use dispatch::{ToolDispatcher, ToolOutcome};
pub use engine::{CancelHandle, ExecutionEngine, RunHandle, RunTask};
pub use error::{EngineError, RunFailure};
pub use event::{EventObserver, ExecutionEvent, TracingObserver};
pub use options::{OutputSchema, RetryConfig, RunOptions};
pub use stream::{EventHub, EventStream};
pub use validator::{FieldError, SchemaError, StructuredOutputValidator, corrective_message, validate};
