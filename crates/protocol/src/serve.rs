//! Running an engine behind the protocol bridge.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tideloop_agent::{
    AgentResult, CancelHandle, EngineError, ExecutionEngine, ResultAggregator, RunHandle,
    RunOptions,
};
use tideloop_core::message::Thread;

use crate::adapter::{ProtocolAdapter, ProtocolError};
use crate::types::{DeliveryMode, ProtocolUpdate};

/// A run in flight behind the bridge.
pub struct ServeHandle {
    /// Protocol frames, in order. Drain it or drop it: dropping the receiver
    /// disconnects the transport without stopping the run.
    pub updates: mpsc::Receiver<ProtocolUpdate>,

    /// Resolves once the run has concluded.
    pub outcome: JoinHandle<Result<AgentResult, EngineError>>,

    pub artifact_id: String,

    cancel: CancelHandle,
}

impl ServeHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run's outcome.
    pub async fn finish(self) -> Result<AgentResult, EngineError> {
        self.outcome
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))?
    }
}

/// Start a run whose events feed both the protocol adapter and the result
/// aggregator.
pub fn serve(
    engine: &ExecutionEngine,
    thread: Thread,
    options: RunOptions,
    mode: DeliveryMode,
) -> ServeHandle {
    let adapter = ProtocolAdapter::new(mode, thread.id.to_string());
    serve_with(engine, thread, options, adapter)
}

/// Like [`serve`], with a preconfigured adapter.
pub fn serve_with(
    engine: &ExecutionEngine,
    thread: Thread,
    options: RunOptions,
    adapter: ProtocolAdapter,
) -> ServeHandle {
    let mut hub = engine.event_hub();
    let adapter_events = hub.subscribe();
    let result_events = hub.subscribe();
    let artifact_id = adapter.artifact_id().to_string();
    info!(
        task_id = %adapter.task_id(),
        artifact_id = %artifact_id,
        mode = ?adapter.mode(),
        "Serving run over protocol bridge"
    );

    let task = engine.start(thread, options, hub);
    let cancel = task.cancel_handle();

    let (tx, rx) = mpsc::channel(engine.event_buffer());
    tokio::spawn(async move {
        match adapter.pump(adapter_events, tx).await {
            Ok(()) => {}
            Err(ProtocolError::TransportDisconnected) => {
                debug!("Protocol consumer left before the run finished")
            }
            Err(e) => debug!(error = %e, "Protocol adapter stopped"),
        }
    });

    let outcome = tokio::spawn(ResultAggregator::collect(RunHandle {
        events: result_events,
        task,
    }));

    ServeHandle {
        updates: rx,
        outcome,
        artifact_id,
        cancel,
    }
}
