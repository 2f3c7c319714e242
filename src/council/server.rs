//! HTTP/SSE surface.
//!
//! One router over a shared [`AppState`]. Request/response endpoints run the
//! council synchronously; the `/stream` endpoints spawn the turn onto a task
//! that feeds a bounded event channel rendered as Server-Sent Events. When
//! the SSE client disconnects, the channel closes, the turn task observes the
//! failed send and aborts the in-flight fan-out; the user message is marked
//! `failed` only if the assistant write had not committed yet.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::council::config::{ConfigStore, ConfigUpdate, CouncilConfig};
use crate::council::context::ContextManager;
use crate::council::error::CouncilError;
use crate::council::events::{CouncilEvent, TitleData};
use crate::council::model::{
    ChairmanAnswer, Conversation, ConversationSummary, ModelRanking, ModelResponse,
    StoredMessage, UserStatus, DEFAULT_CONVERSATION_TITLE,
};
use crate::council::orchestrator::{generate_title, CouncilOrchestrator, PriorTurns};
use crate::council::provider::Provider;
use crate::council::providers::ProviderFactory;
use crate::council::ranking::AggregateRanking;
use crate::council::store::{ConversationLocks, ConversationStore, StoreError};

/// Capacity of the per-request event channel; a lagging SSE consumer
/// backpressures the pipeline here.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared application state behind every handler.
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub config_store: Arc<dyn ConfigStore>,
    pub locks: Arc<ConversationLocks>,
    pub context: Arc<ContextManager>,
    pub providers: Arc<dyn ProviderFactory>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        config_store: Arc<dyn ConfigStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Arc<Self> {
        let locks = Arc::new(ConversationLocks::new());
        let context = Arc::new(ContextManager::new(store.clone(), locks.clone()));
        Arc::new(Self {
            store,
            config_store,
            locks,
            context,
            providers,
        })
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/message", post(send_message))
        .route(
            "/api/conversations/{id}/message/stream",
            post(send_message_stream),
        )
        .route("/api/conversations/{id}/pending/retry", post(retry_pending))
        .route(
            "/api/conversations/{id}/pending/retry/stream",
            post(retry_pending_stream),
        )
        .route(
            "/api/conversations/{id}/pending/remove",
            post(remove_pending),
        )
        .route(
            "/api/conversations/{id}/user-message/status",
            post(mark_user_message_status),
        )
        .route("/api/available-models", get(available_models))
        .route(
            "/api/council-config",
            get(get_council_config).post(set_council_config),
        )
        .with_state(state)
}

// ── Request/response bodies ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub skip_stages: bool,
    #[serde(default)]
    pub reply_to_response: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub skip_stages: bool,
}

fn default_keep_last() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RemovePendingRequest {
    #[serde(default = "default_keep_last")]
    pub keep_last: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TurnMetadata {
    pub label_to_model: serde_json::Value,
    pub aggregate_rankings: Vec<AggregateRanking>,
}

/// Body of the synchronous message and retry endpoints.
#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub stage1: Vec<ModelResponse>,
    pub stage2: Vec<ModelRanking>,
    pub stage3: ChairmanAnswer,
    pub metadata: TurnMetadata,
}

fn internal(e: StoreError) -> CouncilError {
    match e {
        StoreError::NotFound(_) => CouncilError::NotFound("Conversation".to_string()),
        StoreError::Io(msg) => CouncilError::Internal(msg),
    }
}

// ── Conversation CRUD ────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "LLM Council API" }))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ConversationSummary>> {
    Json(state.store.list().await)
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Conversation>, CouncilError> {
    let id = uuid::Uuid::new_v4().to_string();
    let conversation = state.store.create(&id).await.map_err(internal)?;
    Ok(Json(conversation))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, CouncilError> {
    match state.store.get(&id).await {
        Some(conversation) => Ok(Json(conversation)),
        None => Err(CouncilError::NotFound("Conversation".to_string())),
    }
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, CouncilError> {
    state.store.delete(&id).await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ── Pending-message maintenance ──────────────────────────────────────────

async fn remove_pending(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RemovePendingRequest>,
) -> Result<Json<serde_json::Value>, CouncilError> {
    let keep_last = body.keep_last;
    let _guard = state.locks.acquire(&id).await;
    let removed = state
        .store
        .remove_pending_user_messages(&id, keep_last)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn mark_user_message_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<serde_json::Value>, CouncilError> {
    let status = body
        .status
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CouncilError::BadRequest("status is required".to_string()))?;
    let status = UserStatus::parse(&status)
        .ok_or_else(|| CouncilError::BadRequest(format!("invalid status '{}'", status)))?;

    let _guard = state.locks.acquire(&id).await;
    let success = state
        .store
        .mark_last_user_message_status(&id, status)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "success": success })))
}

// ── Models & config ──────────────────────────────────────────────────────

async fn available_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModelsQuery>,
) -> Json<serde_json::Value> {
    let config = state.config_store.get().await;
    let provider_name = query.provider.unwrap_or_else(|| "ollama".to_string());

    if matches!(provider_name.to_lowercase().as_str(), "ollama" | "local") {
        let provider = state.providers.provider_for(Some("ollama"), &config);
        let models = provider.list_models().await;
        return Json(serde_json::json!({ "provider": "ollama", "models": models }));
    }

    Json(serde_json::json!({
        "provider": "openrouter",
        "models": config.council_models,
    }))
}

async fn get_council_config(State(state): State<Arc<AppState>>) -> Json<CouncilConfig> {
    Json(state.config_store.get().await)
}

async fn set_council_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<CouncilConfig>, CouncilError> {
    let mut config = state.config_store.get().await;
    config.apply(update);
    state
        .config_store
        .set(config.clone())
        .await
        .map_err(|e| CouncilError::Internal(e.to_string()))?;
    Ok(Json(config))
}

// ── Synchronous message & retry ──────────────────────────────────────────

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<TurnResponse>, CouncilError> {
    let conversation = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| CouncilError::NotFound("Conversation".to_string()))?;
    let is_first_message = conversation.messages.is_empty();

    {
        let _guard = state.locks.acquire(&id).await;
        state
            .store
            .add_user_message(&id, &request.content)
            .await
            .map_err(internal)?;
    }

    let config = state.config_store.get().await;
    let provider = state
        .providers
        .provider_for(request.provider.as_deref(), &config);

    if is_first_message {
        let title = generate_title(&provider, &request.content).await;
        let _guard = state.locks.acquire(&id).await;
        state
            .store
            .update_title(&id, &title)
            .await
            .map_err(internal)?;
    }

    let response = run_sync_turn(
        &state,
        &id,
        &config,
        provider,
        &request.content,
        request.reply_to_response.as_deref(),
        request.skip_stages,
    )
    .await?;
    Ok(Json(response))
}

async fn retry_pending(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<TurnResponse>, CouncilError> {
    let content = check_retryable(&state, &id).await?;

    let config = state.config_store.get().await;
    let provider = state
        .providers
        .provider_for(request.provider.as_deref(), &config);

    let response = run_sync_turn(
        &state,
        &id,
        &config,
        provider,
        &content,
        None,
        request.skip_stages,
    )
    .await?;
    Ok(Json(response))
}

/// Validate that the last user message can be retried; returns its content.
async fn check_retryable(state: &Arc<AppState>, id: &str) -> Result<String, CouncilError> {
    state
        .store
        .get(id)
        .await
        .ok_or_else(|| CouncilError::NotFound("Conversation".to_string()))?;

    let last = state
        .store
        .get_last_user_message(id)
        .await
        .ok_or_else(|| CouncilError::NotFound("User message to retry".to_string()))?;

    match last {
        StoredMessage::User {
            content, status, ..
        } => {
            let status = status.unwrap_or(UserStatus::Complete);
            if status == UserStatus::Complete {
                return Err(CouncilError::BadRequest(format!(
                    "Last user message status is '{}', cannot retry",
                    status.as_str()
                )));
            }
            if content.is_empty() {
                return Err(CouncilError::BadRequest(
                    "Last user message has no content".to_string(),
                ));
            }
            Ok(content)
        }
        _ => Err(CouncilError::NotFound("User message to retry".to_string())),
    }
}

/// Drive one non-streaming turn: context, pipeline, persistence, status.
async fn run_sync_turn(
    state: &Arc<AppState>,
    id: &str,
    config: &CouncilConfig,
    provider: Arc<dyn Provider>,
    content: &str,
    reply_to: Option<&str>,
    skip_stages: bool,
) -> Result<TurnResponse, CouncilError> {
    let prior = state
        .context
        .build_prior_context(id, &provider, &config.chairman_model)
        .await;

    let orchestrator = CouncilOrchestrator::new(provider.clone(), config);
    let outcome = match orchestrator
        .run(
            content,
            prior.text.clone().map(PriorTurns::Text),
            reply_to,
            skip_stages,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            mark_failed(state, id).await;
            return Err(err);
        }
    };

    {
        let _guard = state.locks.acquire(id).await;
        if let Err(e) = state
            .store
            .add_assistant_message(
                id,
                outcome.stage1.clone(),
                outcome.stage2.clone(),
                outcome.stage3.clone(),
            )
            .await
        {
            mark_failed(state, id).await;
            return Err(internal(e));
        }
    }

    schedule_background_summary(state, id, config, provider, prior.wrote_summary).await;

    Ok(TurnResponse {
        stage1: outcome.stage1,
        stage2: outcome.stage2,
        stage3: outcome.stage3,
        metadata: TurnMetadata {
            label_to_model: outcome.label_map.to_value(),
            aggregate_rankings: outcome.aggregate_rankings,
        },
    })
}

async fn mark_failed(state: &Arc<AppState>, id: &str) {
    let _guard = state.locks.acquire(id).await;
    if let Err(e) = state
        .store
        .mark_last_user_message_status(id, UserStatus::Failed)
        .await
    {
        log::error!("could not mark user message failed for {}: {}", id, e);
    }
}

/// Kick off best-effort background summarization when the conversation has
/// outgrown retention and the foreground path did not already summarize.
async fn schedule_background_summary(
    state: &Arc<AppState>,
    id: &str,
    config: &CouncilConfig,
    provider: Arc<dyn Provider>,
    wrote_sync_summary: bool,
) {
    if wrote_sync_summary {
        return;
    }
    let num_to_summarize = state.context.pending_summary_count(id).await;
    if num_to_summarize == 0 {
        return;
    }
    let context = state.context.clone();
    let id = id.to_string();
    let chairman = config.chairman_model.clone();
    tokio::spawn(async move {
        context
            .background_summarize(&id, num_to_summarize, provider, chairman)
            .await;
    });
}

// ── Streaming message & retry ────────────────────────────────────────────

async fn send_message_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, CouncilError> {
    let conversation = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| CouncilError::NotFound("Conversation".to_string()))?;
    let is_first_message = conversation.messages.is_empty();

    let params = TurnParams {
        content: request.content,
        provider_hint: request.provider,
        skip_stages: request.skip_stages,
        reply_to: request.reply_to_response,
        add_user_message: true,
        generate_title: is_first_message,
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(streaming_turn(state.clone(), id, params, tx));
    Ok(sse_response(rx))
}

async fn retry_pending_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RetryRequest>,
) -> Result<Response, CouncilError> {
    let content = check_retryable(&state, &id).await?;

    let params = TurnParams {
        content,
        provider_hint: request.provider,
        skip_stages: request.skip_stages,
        reply_to: None,
        // The message under retry is already stored.
        add_user_message: false,
        generate_title: false,
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(streaming_turn(state.clone(), id, params, tx));
    Ok(sse_response(rx))
}

struct TurnParams {
    content: String,
    provider_hint: Option<String>,
    skip_stages: bool,
    reply_to: Option<String>,
    add_user_message: bool,
    generate_title: bool,
}

/// Render the event channel as an SSE response.
fn sse_response(rx: mpsc::Receiver<CouncilEvent>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let frame = Event::default().json_data(&event).unwrap_or_else(|e| {
            log::error!("SSE serialization failed: {}", e);
            Event::default().data("{}")
        });
        Some((Ok::<_, Infallible>(frame), rx))
    });
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream),
    )
        .into_response()
}

/// Own one streaming turn end to end. Any failure before the assistant write
/// marks the user message `failed`; after the write the turn is committed and
/// event-send failures are ignored.
async fn streaming_turn(
    state: Arc<AppState>,
    conversation_id: String,
    params: TurnParams,
    tx: mpsc::Sender<CouncilEvent>,
) {
    match streaming_turn_inner(&state, &conversation_id, params, &tx).await {
        Ok(()) => {}
        Err(CouncilError::Cancelled) => {
            log::info!(
                "client disconnected mid-turn on {}; workers cancelled",
                conversation_id
            );
            mark_failed(&state, &conversation_id).await;
        }
        Err(err) => {
            log::error!("turn failed on {}: {}", conversation_id, err);
            mark_failed(&state, &conversation_id).await;
            let _ = tx
                .send(CouncilEvent::Error {
                    message: err.to_string(),
                })
                .await;
        }
    }
}

async fn streaming_turn_inner(
    state: &Arc<AppState>,
    id: &str,
    params: TurnParams,
    tx: &mpsc::Sender<CouncilEvent>,
) -> Result<(), CouncilError> {
    if params.add_user_message {
        let _guard = state.locks.acquire(id).await;
        state
            .store
            .add_user_message(id, &params.content)
            .await
            .map_err(internal)?;
    }

    let config = state.config_store.get().await;
    let provider = state
        .providers
        .provider_for(params.provider_hint.as_deref(), &config);

    // Title generation runs alongside the pipeline; it is joined after
    // stage 3 so the title event lands before `complete`.
    let title_task = if params.generate_title {
        let provider = provider.clone();
        let content = params.content.clone();
        Some(tokio::spawn(
            async move { generate_title(&provider, &content).await },
        ))
    } else {
        None
    };

    let prior = state
        .context
        .build_prior_context(id, &provider, &config.chairman_model)
        .await;

    let orchestrator = CouncilOrchestrator::new(provider.clone(), &config);
    let outcome = orchestrator
        .run_streaming(
            &params.content,
            prior.text.clone().map(PriorTurns::Text),
            params.reply_to.as_deref(),
            params.skip_stages,
            tx,
        )
        .await?;

    if let Some(task) = title_task {
        let title = task
            .await
            .unwrap_or_else(|_| DEFAULT_CONVERSATION_TITLE.to_string());
        {
            let _guard = state.locks.acquire(id).await;
            state
                .store
                .update_title(id, &title)
                .await
                .map_err(internal)?;
        }
        tx.send(CouncilEvent::TitleComplete {
            data: TitleData { title },
        })
        .await
        .map_err(|_| CouncilError::Cancelled)?;
    }

    // The store write that commits the turn; it also flips the user message
    // to complete.
    {
        let _guard = state.locks.acquire(id).await;
        state
            .store
            .add_assistant_message(
                id,
                outcome.stage1.clone(),
                outcome.stage2.clone(),
                outcome.stage3.clone(),
            )
            .await
            .map_err(internal)?;
    }

    // Committed. Everything below is best-effort and must not flip the user
    // message back to failed.
    schedule_background_summary(state, id, &config, provider, prior.wrote_summary).await;
    let _ = tx.send(CouncilEvent::Complete).await;
    Ok(())
}
