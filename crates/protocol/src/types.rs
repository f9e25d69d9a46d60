//! Wire types for the artifact/status protocol.
//!
//! Frames follow the A2A shape: a task emits `artifact-update` frames carrying
//! content parts and `status-update` frames carrying its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a run's output is delivered to the external consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One artifact with the complete result once the run finishes.
    Aggregated,

    /// Chunks as they are produced.
    #[default]
    Incremental,
}

/// One piece of artifact content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub parts: Vec<Part>,
}

impl Artifact {
    /// All text parts, concatenated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::Data { .. } => None,
            })
            .collect()
    }

    /// The first data part, if any.
    pub fn data(&self) -> Option<&Value> {
        self.parts.iter().find_map(|p| match p {
            Part::Data { data } => Some(data),
            Part::Text { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactUpdate {
    pub task_id: String,
    pub artifact: Artifact,
    /// Extends previously sent content of the same artifact
    pub append: bool,
    /// No more chunks follow for this artifact
    pub last_chunk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// A frame pushed to the external consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProtocolUpdate {
    #[serde(rename = "artifact-update")]
    Artifact(ArtifactUpdate),

    #[serde(rename = "status-update")]
    Status(StatusUpdate),
}

impl ProtocolUpdate {
    /// Wire name of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Artifact(_) => "artifact-update",
            Self::Status(_) => "status-update",
        }
    }

    /// True for the status update that closes the task.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Status(s) if s.is_final)
    }
}
