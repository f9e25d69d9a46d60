//! Error types shared across the engine.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the completion client.
///
/// The engine never retries these; they end the run and are surfaced to the
/// caller unchanged.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    #[error("Provider not configured: {reason}")]
    NotConfigured { reason: String },

    #[error("Network error: {reason}")]
    Network { reason: String },
}

/// Failure while resolving or executing a tool.
///
/// Tool errors never leave the dispatcher as errors: the loop turns them into
/// tool-result messages so the model can react.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool '{0}' requires a runtime context but none was supplied")]
    MissingContext(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool panicked: {tool_name}: {reason}")]
    Panicked { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}
