//! Protocol bridge for Tideloop.
//!
//! Re-emits a run's execution events as artifact and status frames for an
//! external push-based protocol, either as one aggregated artifact or as
//! incremental chunks. The bridge is just another event consumer: it never
//! changes what the run does, and a consumer that disconnects never stops it.

pub mod adapter;
pub mod serve;
pub mod types;

pub use adapter::{ProtocolAdapter, ProtocolError};
pub use serve::{ServeHandle, serve, serve_with};
pub use types::{
    Artifact, ArtifactUpdate, DeliveryMode, Part, ProtocolUpdate, StatusUpdate, TaskState,
    TaskStatus,
};
