//! HTTP surface: thread CRUD, streaming runs over SSE, and run cancellation.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::client::DeepSeekClient;
use crate::config::{Config, ProviderKind};
use crate::error_taxonomy::{ErrorCategory, RuntimeError};
use crate::llm_client::{MockClient, SharedLlmClient};
use crate::logging;
use crate::models::{InputMessage, Thread, WireMessage};
use crate::run_coordinator::{RunCoordinator, RunRequest, RunStream, SharedRunCoordinator};
use crate::stream_protocol::{Frame, resolve_stream_modes};
use crate::thread_store::{SharedThreadStore, ThreadStore};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SEARCH_LIMIT: usize = 10;
const X_RUN_ID: &str = "x-run-id";
const X_THREAD_ID: &str = "x-thread-id";

#[derive(Clone)]
pub struct RuntimeApiState {
    pub store: SharedThreadStore,
    pub runs: SharedRunCoordinator,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeApiOptions {
    pub host: String,
    pub port: u16,
}

// === Request / response types ===

#[derive(Debug, Default, Deserialize)]
struct CreateThreadRequest {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchThreadsRequest {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListThreadsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RunStreamRequest {
    input: RunInput,
    #[serde(default)]
    stream_mode: Option<StreamModeParam>,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunInput {
    #[serde(default)]
    messages: Vec<InputMessage>,
}

/// `stream_mode` may be a single name or a list of names.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamModeParam {
    One(String),
    Many(Vec<String>),
}

impl StreamModeParam {
    fn into_vec(self) -> Vec<String> {
        match self {
            StreamModeParam::One(mode) => vec![mode],
            StreamModeParam::Many(modes) => modes,
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    status: &'static str,
    version: &'static str,
    model: String,
}

#[derive(Debug, Serialize)]
struct ThreadResponse {
    thread_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Value,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ThreadListEntry {
    thread_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Value,
    status: &'static str,
    message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview: Option<String>,
}

#[derive(Debug, Serialize)]
struct ThreadSearchEntry {
    thread_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Value,
    status: &'static str,
    values: ThreadValues,
}

#[derive(Debug, Serialize)]
struct ThreadValues {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct ThreadStateResponse {
    values: ThreadValues,
    next: Vec<String>,
    config: Value,
}

impl ThreadStateResponse {
    fn from_thread(thread: &Thread) -> Self {
        Self {
            values: ThreadValues {
                messages: thread.wire_messages(),
            },
            next: Vec::new(),
            config: json!({ "configurable": { "thread_id": thread.thread_id } }),
        }
    }
}

// === Server ===

/// Build the language-model client selected by configuration.
pub fn build_llm_client(config: &Config) -> Result<SharedLlmClient> {
    match config.provider() {
        ProviderKind::Mock => Ok(Arc::new(MockClient::new(config.model()))),
        ProviderKind::DeepSeek => {
            let client =
                DeepSeekClient::new(config).context("Failed to initialize DeepSeek client")?;
            Ok(Arc::new(client))
        }
    }
}

/// Start the HTTP server and serve until interrupted.
pub async fn run_http_server(config: Config, options: RuntimeApiOptions) -> Result<()> {
    if options.port == 0 {
        bail!("Port must be > 0");
    }

    let db_path = config.database_path();
    let store = Arc::new(
        ThreadStore::open_sqlite(&db_path)
            .with_context(|| format!("Failed to open thread store at {}", db_path.display()))?
            .with_cache_capacity(config.cache_capacity()),
    );
    logging::info(format!(
        "Thread store: {} (caching up to {} threads)",
        db_path.display(),
        config.cache_capacity()
    ));

    let llm = build_llm_client(&config)?;
    logging::info(format!(
        "Provider: {} (model {}), run policy: {}",
        llm.provider_name(),
        llm.model(),
        config.run_policy().as_str()
    ));
    let runs = Arc::new(RunCoordinator::new(
        Arc::clone(&store),
        llm,
        config.run_policy(),
    ));

    let state = RuntimeApiState {
        store,
        runs: Arc::clone(&runs),
        cors_origins: config.cors_origins(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", options.host, options.port)
        .parse()
        .with_context(|| format!("Invalid bind address '{}:{}'", options.host, options.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    logging::info(format!("threadrun listening on http://{addr}"));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("HTTP server error: {e}"))?;

    let active = runs.active_run_count();
    if active > 0 {
        logging::warn(format!("{active} run(s) still active at shutdown"));
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        logging::warn(format!("Failed to listen for shutdown signal: {err}"));
        std::future::pending::<()>().await;
    }
    logging::info("Shutting down");
}

pub fn build_router(state: RuntimeApiState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    Router::new()
        .route("/info", get(info))
        .route("/threads", get(list_threads).post(create_thread))
        .route("/threads/search", post(search_threads))
        .route("/threads/{id}", delete(delete_thread))
        .route("/threads/{id}/state", get(get_thread_state))
        .route("/threads/{id}/history", post(get_thread_history))
        .route("/threads/{id}/runs/stream", post(stream_thread_run))
        .route("/runs/stream", post(stream_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .layer(cors)
        .with_state(state)
}

// === Handlers ===

async fn info(State(state): State<RuntimeApiState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        model: state.runs.model().to_string(),
    })
}

async fn create_thread(
    State(state): State<RuntimeApiState>,
    body: Bytes,
) -> Result<Json<ThreadResponse>, ApiError> {
    let req: CreateThreadRequest = parse_optional_body(&body)?;
    let thread_id = non_empty(req.thread_id).unwrap_or_else(|| Uuid::new_v4().to_string());
    let thread = state.store.create(&thread_id).await.map_err(RuntimeError::from)?;
    Ok(Json(ThreadResponse {
        status: thread_status(&state, &thread.thread_id),
        thread_id: thread.thread_id,
        created_at: thread.created_at,
        updated_at: thread.updated_at,
        metadata: json!({}),
    }))
}

async fn list_threads(
    State(state): State<RuntimeApiState>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<Vec<ThreadListEntry>>, ApiError> {
    let summaries = state.store.list().await.map_err(RuntimeError::from)?;
    let entries = summaries
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .map(|summary| ThreadListEntry {
            status: thread_status(&state, &summary.thread_id),
            thread_id: summary.thread_id,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
            metadata: json!({}),
            message_count: summary.message_count,
            preview: summary.preview,
        })
        .collect();
    Ok(Json(entries))
}

async fn search_threads(
    State(state): State<RuntimeApiState>,
    body: Bytes,
) -> Result<Json<Vec<ThreadSearchEntry>>, ApiError> {
    let req: SearchThreadsRequest = parse_optional_body(&body)?;
    // Thread metadata is not stored, so only an empty filter can match.
    if !metadata_filter_is_empty(req.metadata.as_ref()) {
        return Ok(Json(Vec::new()));
    }
    let wanted_status = non_empty(req.status).map(|status| status.to_ascii_lowercase());

    let summaries = state.store.list().await.map_err(RuntimeError::from)?;
    let matching = summaries
        .into_iter()
        .map(|summary| (thread_status(&state, &summary.thread_id), summary))
        .filter(|(status, _)| wanted_status.as_deref().is_none_or(|wanted| wanted == *status))
        .skip(req.offset.unwrap_or(0))
        .take(req.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));

    let mut entries = Vec::new();
    for (status, summary) in matching {
        // A thread deleted since listing is simply skipped.
        let Some(thread) = state
            .store
            .get(&summary.thread_id)
            .await
            .map_err(RuntimeError::from)?
        else {
            continue;
        };
        entries.push(ThreadSearchEntry {
            values: ThreadValues {
                messages: thread.wire_messages(),
            },
            thread_id: thread.thread_id,
            created_at: thread.created_at,
            updated_at: thread.updated_at,
            metadata: json!({}),
            status,
        });
    }
    Ok(Json(entries))
}

async fn get_thread_state(
    State(state): State<RuntimeApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadStateResponse>, ApiError> {
    let thread = load_thread(&state, &thread_id).await?;
    Ok(Json(ThreadStateResponse::from_thread(&thread)))
}

async fn get_thread_history(
    State(state): State<RuntimeApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<ThreadStateResponse>>, ApiError> {
    let thread = load_thread(&state, &thread_id).await?;
    Ok(Json(vec![ThreadStateResponse::from_thread(&thread)]))
}

async fn delete_thread(
    State(state): State<RuntimeApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state
        .store
        .delete(&thread_id)
        .await
        .map_err(RuntimeError::from)?;
    if !removed {
        return Err(RuntimeError::ThreadNotFound(thread_id).into());
    }
    Ok(Json(json!({ "status": "deleted", "thread_id": thread_id })))
}

async fn stream_thread_run(
    State(state): State<RuntimeApiState>,
    Path(thread_id): Path<String>,
    payload: Result<Json<RunStreamRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    start_stream(&state, thread_id, req).await
}

async fn stream_run(
    State(state): State<RuntimeApiState>,
    payload: Result<Json<RunStreamRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut req) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let thread_id =
        non_empty(req.thread_id.take()).unwrap_or_else(|| Uuid::new_v4().to_string());
    start_stream(&state, thread_id, req).await
}

async fn cancel_run(
    State(state): State<RuntimeApiState>,
    Path(run_id): Path<String>,
) -> Json<Value> {
    let outcome = state.runs.cancel(&run_id);
    Json(json!({ "status": outcome.as_str(), "run_id": run_id }))
}

// === Helpers ===

async fn start_stream(
    state: &RuntimeApiState,
    thread_id: String,
    req: RunStreamRequest,
) -> Result<Response, ApiError> {
    let input = req
        .input
        .messages
        .into_iter()
        .map(InputMessage::into_message)
        .collect();
    let requested = req.stream_mode.map(StreamModeParam::into_vec).unwrap_or_default();
    let run = state
        .runs
        .start(RunRequest {
            thread_id,
            input,
            modes: resolve_stream_modes(&requested),
            create_thread: true,
        })
        .await?;
    Ok(sse_response(run))
}

fn sse_response(run: RunStream) -> Response {
    let run_id = HeaderValue::from_str(&run.run_id).ok();
    let thread_id = HeaderValue::from_str(&run.thread_id).ok();
    let events = run.map(|frame| Ok::<_, Infallible>(sse_frame(&frame)));

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("connection"),
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Some(value) = run_id {
        headers.insert(HeaderName::from_static(X_RUN_ID), value);
    }
    if let Some(value) = thread_id {
        headers.insert(HeaderName::from_static(X_THREAD_ID), value);
    }
    response
}

fn sse_frame(frame: &Frame) -> SseEvent {
    sse_json(frame.event(), frame.data())
}

fn sse_json(event: &str, payload: Value) -> SseEvent {
    let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event).data(data)
}

async fn load_thread(state: &RuntimeApiState, thread_id: &str) -> Result<Thread, ApiError> {
    state
        .store
        .get(thread_id)
        .await
        .map_err(RuntimeError::from)?
        .ok_or_else(|| RuntimeError::ThreadNotFound(thread_id.to_string()).into())
}

fn thread_status(state: &RuntimeApiState, thread_id: &str) -> &'static str {
    if state.runs.is_thread_busy(thread_id) {
        "busy"
    } else {
        "idle"
    }
}

fn metadata_filter_is_empty(filter: Option<&Value>) -> bool {
    match filter {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Decode a JSON body that may be absent entirely.
fn parse_optional_body<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let allow_origin = if allowed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(X_RUN_ID),
            HeaderName::from_static(X_THREAD_ID),
        ])
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match err.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Persistence | ErrorCategory::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCategory::Network
            | ErrorCategory::Authentication
            | ErrorCategory::RateLimit
            | ErrorCategory::Upstream
            | ErrorCategory::Parse => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(code = %err.envelope().code, error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.message,
                    "status": self.status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}
