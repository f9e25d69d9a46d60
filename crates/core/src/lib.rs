//! # Tideloop Core
//!
//! Domain types, traits, and error definitions for the Tideloop agent
//! execution engine. This crate defines the model every other crate works
//! against: threads and messages, the completion-client trait, the tool
//! traits and registry, and the collaborator error types.
//!
//! ## Design Philosophy
//!
//! Each external collaborator is a trait here. The engine only ever talks to
//! these traits, which keeps it testable with scripted mocks and lets the
//! embedding application plug in any completion backend or tool set.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use message::{Attachment, Message, MessageToolCall, Role, Thread, ThreadId};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, ResponseFormat, StreamChunk, ToolDefinition,
    Usage,
};
pub use tool::{
    BlockingTool, Tool, ToolCall, ToolContext, ToolDescriptor, ToolInvoker, ToolRegistry,
    ToolResult,
};
