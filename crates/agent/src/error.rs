//! Run-level errors.
//!
//! A run never fails mid-stream: the terminal event carries a [`RunFailure`],
//! and blocking callers get it back as an [`EngineError`] once the run has
//! concluded.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use tideloop_core::error::ProviderError;

use crate::validator::FieldError;

/// Why a run ended without completing. Carried by the terminal
/// `execution_error` event.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("structured output still invalid after all retries ({} errors)", .errors.len())]
    SchemaValidationExhausted {
        errors: Vec<FieldError>,
        last_payload: String,
    },

    #[error("iteration limit of {max_turns} turns exceeded")]
    IterationLimitExceeded { max_turns: u32 },

    #[error("completion call timed out after {timeout_ms}ms")]
    CompletionTimeout { timeout_ms: u64 },

    #[error("{error}")]
    Provider { error: ProviderError },

    #[error("invalid output schema: {reason}")]
    InvalidSchema { reason: String },

    #[error("run cancelled")]
    Cancelled,
}

/// Error returned by the blocking API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("structured output failed validation after {retry_count} retries ({} errors)", .errors.len())]
    StructuredOutput {
        errors: Vec<FieldError>,
        last_payload: String,
        retry_count: u32,
    },

    #[error("iteration limit of {max_turns} turns exceeded")]
    IterationLimit { max_turns: u32 },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("completion call timed out after {0:?}")]
    CompletionTimeout(Duration),

    #[error("invalid output schema: {0}")]
    InvalidSchema(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Convert the failure reported by a terminal event.
    pub fn from_failure(failure: RunFailure, retry_count: u32) -> Self {
        match failure {
            RunFailure::SchemaValidationExhausted {
                errors,
                last_payload,
            } => Self::StructuredOutput {
                errors,
                last_payload,
                retry_count,
            },
            RunFailure::IterationLimitExceeded { max_turns } => Self::IterationLimit { max_turns },
            RunFailure::CompletionTimeout { timeout_ms } => {
                Self::CompletionTimeout(Duration::from_millis(timeout_ms))
            }
            RunFailure::Provider { error } => Self::Provider(error),
            RunFailure::InvalidSchema { reason } => Self::InvalidSchema(reason),
            RunFailure::Cancelled => Self::Cancelled,
        }
    }
}
