//! Per-run options.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tideloop_config::{MAX_RETRY_CEILING, RetrySettings};
use tideloop_core::provider::ResponseFormat;
use tideloop_core::tool::ToolContext;

use crate::event::EventObserver;

/// Structured-output retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryConfig {
    /// Build a policy. `max_retries` above the ceiling is clamped.
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        let clamped = max_retries.min(MAX_RETRY_CEILING);
        if clamped != max_retries {
            warn!(
                requested = max_retries,
                ceiling = MAX_RETRY_CEILING,
                "max_retries clamped to ceiling"
            );
        }
        Self {
            max_retries: clamped,
            backoff_base,
        }
    }

    /// No corrective retries: the first invalid reply ends the run.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Delay before retry number `retry` (1-based): base × 2^(retry-1).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.backoff_base.is_zero() || retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (retry - 1).min(16);
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.max_retries, settings.backoff_base())
    }
}

/// The schema a run's final answer must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub strict: bool,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// The response-format directive handed to the completion client.
    pub fn response_format(&self) -> ResponseFormat {
        ResponseFormat::JsonSchema {
            name: self.name.clone(),
            schema: self.schema.clone(),
            strict: self.strict,
        }
    }
}

/// Options for one run. Built by the caller, never mutated by the engine.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub schema: Option<OutputSchema>,
    pub context: Option<ToolContext>,
    pub retry: RetryConfig,
    pub observers: Vec<Arc<dyn EventObserver>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_context(mut self, context: ToolContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Opt in to an observer for this run.
    pub fn observe(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("schema", &self.schema.as_ref().map(|s| &s.name))
            .field("context", &self.context)
            .field("retry", &self.retry)
            .field("observers", &self.observers.len())
            .finish()
    }
}
