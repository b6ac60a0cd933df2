//! HTTP surface of the advisor: chat, transcript and realtime endpoints.
//!
//! Handlers are the only place where [`AdvisorError`] becomes a status code
//! or user-visible text.

use crate::broadcast::{Broadcaster, LocalBroadcaster, TranscriptEvent};
use crate::error::{AdvisorError, AdvisorResult};
use crate::ingest::{IngestReport, IngestionCoordinator};
use crate::rag::RagEngine;
use crate::transcript::{session_or_default, Role, TranscriptMessage, TranscriptRepository};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

const STREAM_BUFFER: usize = 32;
const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// `None` when provider credentials are missing
    pub engine: Option<Arc<RagEngine>>,
    pub transcripts: Arc<dyn TranscriptRepository>,
    /// Every realtime target, including `events`
    pub broadcaster: Arc<dyn Broadcaster>,
    /// In-process channels behind `GET /api/events`
    pub events: Arc<LocalBroadcaster>,
}

impl AppState {
    fn engine(&self) -> Result<&Arc<RagEngine>, ApiError> {
        self.engine.as_ref().ok_or_else(|| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "embedding/completion provider is not configured (set GEMINI_API_KEY)",
            )
        })
    }

    fn coordinator(&self) -> Option<&Arc<IngestionCoordinator>> {
        self.engine.as_ref().map(|engine| engine.coordinator())
    }
}

/// Build the router with all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/transcript", get(get_transcript))
        .route("/api/transcript/clear", post(clear_transcript))
        .route("/api/pusher", post(publish_event))
        .route("/api/events", get(stream_events))
        .route("/api/ingest", post(ingest))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Advisor API listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Error response structure
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// Decode an optional JSON body: empty means defaults, malformed is a 400
fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))
}

impl From<AdvisorError> for ApiError {
    fn from(err: AdvisorError) -> Self {
        ApiError::new(status_for(&err), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn status_for(err: &AdvisorError) -> StatusCode {
    match err {
        AdvisorError::Validation(_) => StatusCode::BAD_REQUEST,
        AdvisorError::Provider(_) | AdvisorError::Broadcast(_) => StatusCode::BAD_GATEWAY,
        AdvisorError::SourceFetch { .. } | AdvisorError::Ingestion(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Text recorded as the assistant turn when answering failed
fn failure_answer(err: &AdvisorError) -> String {
    format!("Error: the advisor could not answer ({})", err)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    session_id: Option<String>,
    question: Option<String>,
    student_context: Option<Value>,
}

impl ChatRequest {
    /// The trimmed question, or 400 when it is blank
    fn question(&self) -> Result<&str, ApiError> {
        match self.question.as_deref().map(str::trim) {
            Some(question) if !question.is_empty() => Ok(question),
            _ => Err(ApiError::bad_request("question must not be blank")),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    answer: String,
    count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearRequest {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    ok: bool,
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    session_id: Option<String>,
    role: Role,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Default, Deserialize)]
struct IngestRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    ready: bool,
    chunks: usize,
    generation: u64,
    sessions: usize,
    last_ingest: Option<IngestReport>,
}

/// Append the user and assistant turns, then mirror them to the realtime channel.
///
/// Publishing is best effort and never fails the request.
async fn record_exchange(
    state: &AppState,
    session_id: &str,
    question: &str,
    answer: &str,
) -> AdvisorResult<usize> {
    let count = state
        .transcripts
        .append_many(
            session_id,
            vec![
                TranscriptMessage::user(question),
                TranscriptMessage::assistant(answer),
            ],
        )
        .await?;

    for (role, content) in [(Role::User, question), (Role::Assistant, answer)] {
        if let Err(err) = state
            .broadcaster
            .publish_message(session_id, role, content)
            .await
        {
            warn!("Failed to publish {} message for {}: {}", role, session_id, err);
        }
    }
    Ok(count)
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let (ready, chunks, generation, last_ingest) = match state.coordinator() {
        Some(coordinator) => {
            let store = coordinator.store();
            (
                coordinator.is_ready(),
                store.len(),
                store.generation(),
                coordinator.last_report(),
            )
        }
        None => (false, 0, 0, None),
    };
    Ok(Json(HealthResponse {
        status: "ok",
        ready,
        chunks,
        generation,
        sessions: state.transcripts.session_count().await?,
        last_ingest,
    }))
}

/// Answer a question and return the whole answer at once
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatResponse>), ApiError> {
    let question = request.question()?;
    let engine = state.engine()?;
    let session_id = session_or_default(request.session_id.as_deref());

    let (status, answer) = match engine
        .answer(question, request.student_context.as_ref())
        .await
    {
        Ok(answer) => (StatusCode::OK, answer),
        Err(err) => {
            error!("Chat failed for session {}: {}", session_id, err);
            (status_for(&err), failure_answer(&err))
        }
    };

    let count = record_exchange(&state, &session_id, question, &answer).await?;
    Ok((status, Json(ChatResponse { answer, count })))
}

/// Answer a question as a `text/plain` stream of deltas.
///
/// The exchange is recorded only once the provider stream has ended. A
/// client that disconnects first cancels the upstream request and leaves no
/// trace in the transcript.
async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let question = request.question()?.to_string();
    let engine = state.engine()?.clone();
    let session_id = session_or_default(request.session_id.as_deref());

    let mut deltas = match engine
        .answer_stream(&question, request.student_context.as_ref())
        .await
    {
        Ok(deltas) => deltas,
        Err(err) => {
            error!("Chat stream failed for session {}: {}", session_id, err);
            record_exchange(&state, &session_id, &question, &failure_answer(&err)).await?;
            return Err(err.into());
        }
    };

    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut answer = String::new();
        loop {
            // Dropping `deltas` on return cancels the provider request
            let delta = tokio::select! {
                _ = tx.closed() => {
                    info!("Client left session {} mid-answer; discarding it", session_id);
                    return;
                }
                delta = deltas.next() => delta,
            };

            match delta {
                Some(Ok(text)) => {
                    answer.push_str(&text);
                    if tx.send(text).await.is_err() {
                        info!("Client left session {} mid-answer; discarding it", session_id);
                        return;
                    }
                }
                Some(Err(err)) => {
                    error!("Chat stream aborted for session {}: {}", session_id, err);
                    let label = failure_answer(&err);
                    if tx.send(format!("\n\n{}", label)).await.is_err() {
                        return;
                    }
                    answer = if answer.is_empty() {
                        label
                    } else {
                        format!("{}\n\n{}", answer, label)
                    };
                    break;
                }
                None => break,
            }
        }

        if let Err(err) = record_exchange(&state, &session_id, &question, &answer).await {
            error!("Failed to record exchange for {}: {}", session_id, err);
        }
    });

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|text| (Ok::<_, Infallible>(text), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn get_transcript(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Vec<TranscriptMessage>>, ApiError> {
    let session_id = session_or_default(query.session_id.as_deref());
    Ok(Json(state.transcripts.get(&session_id).await?))
}

async fn clear_transcript(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ClearResponse>, ApiError> {
    let request: ClearRequest = optional_json(&body)?;
    let session_id = session_or_default(request.session_id.as_deref());

    state.transcripts.clear(&session_id).await?;
    if let Err(err) = state.broadcaster.publish_clear(&session_id).await {
        warn!("Failed to publish clear for {}: {}", session_id, err);
    }
    info!("Cleared transcript for session {}", session_id);

    Ok(Json(ClearResponse {
        ok: true,
        session_id,
    }))
}

async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be blank"));
    }
    let session_id = session_or_default(request.session_id.as_deref());

    state
        .broadcaster
        .publish_message(&session_id, request.role, &request.content)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

/// SSE stream of one session's transcript events
async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = session_or_default(query.session_id.as_deref());
    let receiver = state.events.subscribe(&session_id);

    Sse::new(event_stream(receiver)).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT))
}

fn event_stream(
    receiver: broadcast::Receiver<TranscriptEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => {
                let sse_event = Event::default()
                    .event(event.name())
                    .data(serde_json::to_string(&event).unwrap_or_default());
                Some((Ok(sse_event), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Subscriber fell behind; tell it to pull the transcript
                let resync = Event::default()
                    .event("resync")
                    .data(format!("{{\"missed\":{}}}", missed));
                Some((Ok(resync), rx))
            }
        }
    })
}

/// Run ingestion now (or re-run it with `force`)
async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    let request: IngestRequest = optional_json(&body)?;
    let engine = state.engine()?;
    let coordinator = engine.coordinator();

    if request.force {
        coordinator.reset().await;
    }
    Ok(Json(coordinator.ensure_ready().await?))
}
