//! HTTP gateway for Tideloop.
//!
//! Exposes the protocol bridge over HTTP:
//!
//! - `GET  /health`: Liveness
//! - `POST /v1/threads`: Create a thread
//! - `GET  /v1/threads/{id}`: Read a thread's messages
//! - `POST /v1/message/send`: Run a message, aggregated delivery (JSON)
//! - `POST /v1/message/stream`: Run a message, incremental delivery (SSE)
//!
//! Threads live in memory. Each one sits behind its own async mutex, held for
//! the whole run, so two requests never drive the same thread at once.

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::Json,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use tideloop_agent::{AgentResult, EngineError, ExecutionEngine, OutputSchema, RetryConfig, RunOptions};
use tideloop_config::EngineConfig;
use tideloop_core::message::{Message, Thread};
use tideloop_core::provider::Provider;
use tideloop_core::tool::{ToolContext, ToolRegistry};
use tideloop_protocol::{DeliveryMode, ProtocolAdapter, ProtocolUpdate, serve_with};

/// Maximum number of in-memory threads before the oldest idle one is evicted.
const MAX_THREADS: usize = 1_000;

// ── State ─────────────────────────────────────────────────────────────────

struct ThreadEntry {
    created_at: DateTime<Utc>,
    slot: Arc<Mutex<Thread>>,
}

/// Shared state for the gateway.
pub struct GatewayState {
    pub engine: ExecutionEngine,
    pub config: EngineConfig,
    threads: RwLock<HashMap<String, ThreadEntry>>,
}

impl GatewayState {
    pub fn new(engine: ExecutionEngine, config: EngineConfig) -> Self {
        Self {
            engine,
            config,
            threads: RwLock::new(HashMap::new()),
        }
    }

    async fn create_thread(&self) -> (String, DateTime<Utc>, Arc<Mutex<Thread>>) {
        let thread = Thread::new();
        let id = thread.id.to_string();
        let created_at = thread.created_at;
        let slot = Arc::new(Mutex::new(thread));

        let mut threads = self.threads.write().await;
        if threads.len() >= MAX_THREADS {
            // Only evict threads no run is holding
            if let Some(oldest) = threads
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.slot) == 1)
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                threads.remove(&oldest);
            }
        }
        threads.insert(
            id.clone(),
            ThreadEntry {
                created_at,
                slot: slot.clone(),
            },
        );
        (id, created_at, slot)
    }

    async fn thread_slot(&self, id: &str) -> Option<Arc<Mutex<Thread>>> {
        self.threads.read().await.get(id).map(|e| e.slot.clone())
    }
}

pub type SharedState = Arc<GatewayState>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the gateway router.
pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.config.gateway.body_limit_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/threads", post(create_thread_handler))
        .route("/v1/threads/{id}", get(get_thread_handler))
        .route("/v1/message/send", post(send_message_handler))
        .route("/v1/message/stream", post(stream_message_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(
    config: EngineConfig,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let engine = ExecutionEngine::from_config(&config, provider, tools);
    let state = Arc::new(GatewayState::new(engine, config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Tideloop gateway listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateThreadResponse {
    pub id: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadDetailResponse {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: String,
}

/// Body of both message endpoints.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Existing thread to continue; a new one is created when absent
    #[serde(default)]
    pub thread_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub schema: Option<OutputSchema>,
    /// Runtime context for tools that ask for it
    #[serde(default)]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummaryDto {
    pub final_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub turns: u32,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub thread_id: String,
    pub artifact_id: String,
    pub updates: Vec<ProtocolUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunSummaryDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_thread_handler(
    State(state): State<SharedState>,
) -> (StatusCode, Json<CreateThreadResponse>) {
    let (id, created_at, _) = state.create_thread().await;
    (
        StatusCode::CREATED,
        Json(CreateThreadResponse {
            id,
            created_at: created_at.to_rfc3339(),
        }),
    )
}

async fn get_thread_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadDetailResponse>, StatusCode> {
    let slot = state.thread_slot(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    // Waits for any run in progress on this thread
    let thread = slot.lock().await;
    Ok(Json(ThreadDetailResponse {
        id: thread.id.to_string(),
        messages: thread.messages.clone(),
        created_at: thread.created_at.to_rfc3339(),
    }))
}

/// A thread locked for one run, with the user's message already appended.
struct PreparedRun {
    thread_id: String,
    guard: OwnedMutexGuard<Thread>,
    options: RunOptions,
}

async fn prepare_run(state: &GatewayState, payload: SendMessageRequest) -> Result<PreparedRun, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }

    let (thread_id, slot) = match payload.thread_id {
        Some(id) => {
            let slot = state
                .thread_slot(&id)
                .await
                .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown thread '{id}'")))?;
            (id, slot)
        }
        None => {
            let (id, _, slot) = state.create_thread().await;
            (id, slot)
        }
    };

    let mut options = RunOptions::new();
    if let Some(schema) = payload.schema {
        options = options.with_schema(schema);
    }
    if let Some(context) = payload.context {
        options = options.with_context(ToolContext::from_map(context));
    }
    let retry = &state.config.retry;
    options = options.with_retry(match payload.max_retries {
        Some(n) => RetryConfig::new(n, retry.backoff_base()),
        None => RetryConfig::from(retry),
    });

    let mut guard = slot.lock_owned().await;
    guard.push(Message::user(&payload.message));

    Ok(PreparedRun {
        thread_id,
        guard,
        options,
    })
}

/// Store the run's thread back into its slot. Failed runs keep only the
/// user's message.
fn persist(guard: &mut OwnedMutexGuard<Thread>, outcome: &Result<AgentResult, EngineError>) {
    if let Ok(result) = outcome {
        **guard = result.thread.clone();
    }
}

/// `POST /v1/message/send`: run to completion, return every update at once.
async fn send_message_handler(
    State(state): State<SharedState>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let PreparedRun {
        thread_id,
        mut guard,
        options,
    } = prepare_run(&state, payload).await?;
    info!(thread_id = %thread_id, "v1/message/send request");

    let adapter = ProtocolAdapter::new(DeliveryMode::Aggregated, &thread_id);
    let handle = serve_with(&state.engine, Thread::clone(&guard), options, adapter);
    let artifact_id = handle.artifact_id.clone();

    let mut rx = handle.updates;
    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    let outcome = handle
        .outcome
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("run task failed: {e}")))?;
    persist(&mut guard, &outcome);

    let (result, error) = match outcome {
        Ok(r) => (
            Some(RunSummaryDto {
                final_text: r.final_text,
                structured: r.structured,
                turns: r.turns,
                retry_count: r.retry_count,
            }),
            None,
        ),
        Err(e) => {
            warn!(thread_id = %thread_id, error = %e, "Run failed");
            (None, Some(e.to_string()))
        }
    };

    Ok(Json(SendMessageResponse {
        thread_id,
        artifact_id,
        updates,
        result,
        error,
    }))
}

/// `POST /v1/message/stream`: incremental delivery as Server-Sent Events.
async fn stream_message_handler(
    State(state): State<SharedState>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let PreparedRun {
        thread_id,
        mut guard,
        options,
    } = prepare_run(&state, payload).await?;
    info!(thread_id = %thread_id, "v1/message/stream SSE request");

    let adapter = ProtocolAdapter::new(DeliveryMode::Incremental, &thread_id)
        .with_tool_activity(state.config.gateway.surface_tool_activity);
    let handle = serve_with(&state.engine, Thread::clone(&guard), options, adapter);

    // The run outlives the connection; the thread stays locked until it ends
    let outcome = handle.outcome;
    tokio::spawn(async move {
        match outcome.await {
            Ok(outcome) => persist(&mut guard, &outcome),
            Err(e) => warn!(thread_id = %thread_id, error = %e, "Run task failed"),
        }
    });

    let stream = ReceiverStream::new(handle.updates).map(|update| {
        let data = serde_json::to_string(&update).unwrap_or_default();
        Ok(SseEvent::default().event(update.kind()).data(data))
    });

    Ok(Sse::new(stream))
}
