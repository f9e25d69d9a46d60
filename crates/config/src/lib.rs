//! Configuration loading and validation for Tideloop.
//!
//! Loads engine configuration from a TOML file. A missing file yields the
//! defaults; anything present is validated before it is returned.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard upper bound on structured-output retries.
pub const MAX_RETRY_CEILING: u32 = 10;

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution loop settings
    #[serde(default)]
    pub engine: LoopConfig,

    /// Structured-output retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// HTTP bridge settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Iteration ceiling: hard cap on turns per run
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Per-turn completion timeout; unset means no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timeout_secs: Option<u64>,

    /// Capacity of each event subscriber's buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Prepended to every completion request, never stored in the thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_turns() -> u32 {
    25
}
fn default_event_buffer() -> usize {
    128
}

impl LoopConfig {
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            max_turns: default_max_turns(),
            completion_timeout_secs: None,
            event_buffer: default_event_buffer(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before a corrective retry; doubles on each attempt
    #[serde(default)]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

impl RetrySettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Report tool activity as status updates in incremental mode
    #[serde(default = "default_true")]
    pub surface_tool_activity: bool,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit_bytes: default_body_limit(),
            surface_tool_activity: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.temperature < 0.0 || self.engine.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "engine.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.engine.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_turns must be at least 1".into(),
            ));
        }

        if self.engine.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_buffer must be at least 1".into(),
            ));
        }

        if self.retry.max_retries > MAX_RETRY_CEILING {
            return Err(ConfigError::ValidationError(format!(
                "retry.max_retries must be at most {MAX_RETRY_CEILING}"
            )));
        }

        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
