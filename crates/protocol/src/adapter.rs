//! Translating execution events into protocol frames.

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tideloop_agent::{EventStream, ExecutionEvent, RunFailure};

use crate::types::{
    Artifact, ArtifactUpdate, DeliveryMode, Part, ProtocolUpdate, StatusUpdate, TaskState,
    TaskStatus,
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The external consumer went away. The run itself carries on.
    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("event stream ended before the run concluded")]
    Incomplete,
}

/// Re-emits one run's events as artifact and status frames.
///
/// The adapter is a pure translator; [`pump`](Self::pump) connects it to an
/// event stream and a transport.
#[derive(Debug)]
pub struct ProtocolAdapter {
    mode: DeliveryMode,
    task_id: String,
    artifact_id: String,
    surface_tool_activity: bool,
    announced: bool,
    streamed: String,
    finished: bool,
}

impl ProtocolAdapter {
    /// `task_id` names the run externally; usually the thread id.
    pub fn new(mode: DeliveryMode, task_id: impl Into<String>) -> Self {
        Self {
            mode,
            task_id: task_id.into(),
            artifact_id: uuid::Uuid::new_v4().to_string(),
            surface_tool_activity: true,
            announced: false,
            streamed: String::new(),
            finished: false,
        }
    }

    /// Report tool calls as `working` status updates (incremental mode only).
    pub fn with_tool_activity(mut self, enabled: bool) -> Self {
        self.surface_tool_activity = enabled;
        self
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    /// True once the terminal event has been translated.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames for one event, in the order they must be sent.
    pub fn translate(&mut self, event: &ExecutionEvent) -> Vec<ProtocolUpdate> {
        if self.finished {
            return Vec::new();
        }
        let incremental = self.mode == DeliveryMode::Incremental;

        match event {
            ExecutionEvent::TurnStarted { .. } if incremental && !self.announced => {
                self.announced = true;
                vec![self.status(TaskState::Working, None, false)]
            }
            ExecutionEvent::ContentDelta { content } => {
                self.streamed.push_str(content);
                if incremental {
                    vec![self.artifact(vec![text_part(content)], true, false)]
                } else {
                    Vec::new()
                }
            }
            ExecutionEvent::ToolCallStarted { name, .. } if self.reports_tools() => {
                vec![self.status(TaskState::Working, Some(format!("Calling tool {name}")), false)]
            }
            ExecutionEvent::ToolCallFailed { name, error, .. } if self.reports_tools() => {
                vec![self.status(
                    TaskState::Working,
                    Some(format!("Tool {name} failed: {error}")),
                    false,
                )]
            }
            ExecutionEvent::ExecutionComplete {
                content,
                structured,
                ..
            } => {
                self.finished = true;
                let nothing_streamed = self.streamed.is_empty();
                let text = match (self.mode, nothing_streamed) {
                    // Content not already streamed
                    (DeliveryMode::Incremental, true) => content.clone().unwrap_or_default(),
                    (DeliveryMode::Incremental, false) => String::new(),
                    (DeliveryMode::Aggregated, true) => content.clone().unwrap_or_default(),
                    (DeliveryMode::Aggregated, false) => std::mem::take(&mut self.streamed),
                };

                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(Part::Text { text });
                }
                if let Some(data) = structured {
                    parts.push(Part::Data { data: data.clone() });
                }
                let append = incremental && !nothing_streamed;
                vec![
                    self.artifact(parts, append, true),
                    self.status(TaskState::Completed, None, true),
                ]
            }
            ExecutionEvent::ExecutionError { failure, .. } => {
                self.finished = true;
                let state = match failure {
                    RunFailure::Cancelled => TaskState::Canceled,
                    _ => TaskState::Failed,
                };
                vec![self.status(state, Some(failure.to_string()), true)]
            }
            _ => Vec::new(),
        }
    }

    /// Forward a run's events to `updates` until the run concludes.
    ///
    /// If the receiving side is gone the adapter stops and drops its
    /// subscription, which the run prunes without stalling.
    pub async fn pump(
        mut self,
        mut events: EventStream,
        updates: mpsc::Sender<ProtocolUpdate>,
    ) -> Result<(), ProtocolError> {
        while let Some(event) = events.next().await {
            for update in self.translate(&event) {
                if updates.send(update).await.is_err() {
                    warn!(
                        task_id = %self.task_id,
                        event = event.event_type(),
                        "Protocol transport disconnected, dropping subscription"
                    );
                    return Err(ProtocolError::TransportDisconnected);
                }
            }
            if self.finished {
                debug!(task_id = %self.task_id, "Protocol stream complete");
                return Ok(());
            }
        }
        Err(ProtocolError::Incomplete)
    }

    fn reports_tools(&self) -> bool {
        self.mode == DeliveryMode::Incremental && self.surface_tool_activity
    }

    fn artifact(&self, parts: Vec<Part>, append: bool, last_chunk: bool) -> ProtocolUpdate {
        ProtocolUpdate::Artifact(ArtifactUpdate {
            task_id: self.task_id.clone(),
            artifact: Artifact {
                artifact_id: self.artifact_id.clone(),
                parts,
            },
            append,
            last_chunk,
        })
    }

    fn status(&self, state: TaskState, message: Option<String>, is_final: bool) -> ProtocolUpdate {
        ProtocolUpdate::Status(StatusUpdate {
            task_id: self.task_id.clone(),
            status: TaskStatus {
                state,
                message,
                timestamp: Utc::now(),
            },
            is_final,
        })
    }
}

fn text_part(text: &str) -> Part {
    Part::Text {
        text: text.to_string(),
    }
}
