//! Axum JSON operator API for feedsync.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feedsync_adapters::FeedFetchError;
use feedsync_core::{FeedConfig, FeedDraft, ImportRunRecord};
use feedsync_storage::StorageError;
use feedsync_sync::{
    source_fields, EngineError, FeedPreview, ReconcileReport, RepositoryError, RunFailure,
    RunRefusal, RunResult, SavedFeed, SchedulerError, SourceFieldInfo, SyncEngine, TargetFields,
    DEFAULT_LOG_LIMIT, MAX_LOG_ENTRIES,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "feedsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("feed {0} not found")]
    NotFound(String),
    #[error("invalid feed url {0:?}")]
    InvalidUrl(String),
    #[error(transparent)]
    Fetch(#[from] FeedFetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => ApiError::NotFound(id),
            RepositoryError::InvalidUrl(url) => ApiError::InvalidUrl(url),
            RepositoryError::Storage(err) => ApiError::Storage(err),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Repository(err) => err.into(),
            EngineError::Scheduler(err) => err.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ApiError::Fetch(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/feeds", get(list_feeds_handler).post(create_feed_handler))
        .route(
            "/feeds/{id}",
            get(get_feed_handler).put(update_feed_handler).delete(delete_feed_handler),
        )
        .route("/feeds/{id}/toggle", post(toggle_feed_handler))
        .route("/feeds/{id}/run", post(run_feed_handler))
        .route("/preview", post(preview_handler))
        .route("/fields/sources", get(source_fields_handler))
        .route("/fields/targets/{collection}", get(target_fields_handler))
        .route("/logs", get(logs_handler).delete(clear_logs_handler))
        .route("/schedules/reconcile", post(reconcile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<SyncEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn list_feeds_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<FeedConfig>>> {
    Ok(Json(state.engine.repo.list().await?))
}

async fn create_feed_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<FeedDraft>,
) -> ApiResult<(StatusCode, Json<SavedFeed>)> {
    let saved = state.engine.create_feed(draft).await?;
    info!(feed_id = %saved.feed.id, "feed created");
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeedConfig>> {
    match state.engine.repo.get(&id).await? {
        Some(feed) => Ok(Json(feed)),
        None => Err(ApiError::NotFound(id)),
    }
}

async fn update_feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<FeedDraft>,
) -> ApiResult<Json<FeedConfig>> {
    Ok(Json(state.engine.update_feed(&id, draft).await?))
}

async fn delete_feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.delete_feed(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

async fn toggle_feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeedConfig>> {
    Ok(Json(state.engine.toggle_feed(&id).await?))
}

/// Manual runs are always forced. Refusals and failures keep the run result
/// body; an unreachable feed maps to 502 like other upstream errors.
async fn run_feed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<RunResult>) {
    let result = state.engine.pipeline.run(&id, true).await;
    let status = match (result.refusal, result.failure) {
        (Some(RunRefusal::ConfigNotFound), _) => StatusCode::NOT_FOUND,
        (Some(RunRefusal::AlreadyRunning), _) => StatusCode::CONFLICT,
        (_, Some(RunFailure::Fetch)) => StatusCode::BAD_GATEWAY,
        (_, Some(RunFailure::Config)) => StatusCode::INTERNAL_SERVER_ERROR,
        (Some(RunRefusal::FeedDisabled), None) | (None, None) => StatusCode::OK,
    };
    (status, Json(result))
}

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    url: String,
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreviewRequest>,
) -> ApiResult<Json<FeedPreview>> {
    let url = req.url.trim();
    if url.is_empty() {
        return Err(ApiError::InvalidUrl(req.url));
    }
    Ok(Json(state.engine.pipeline.preview(url).await?))
}

async fn source_fields_handler() -> Json<Vec<SourceFieldInfo>> {
    Json(source_fields())
}

async fn target_fields_handler(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
) -> Json<TargetFields> {
    Json(state.engine.mapper.target_fields(&collection).await)
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<usize>,
    feed_id: Option<String>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<ImportRunRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_ENTRIES);
    let feed_id = query.feed_id.as_deref().filter(|id| !id.is_empty());
    Ok(Json(state.engine.logger.recent(limit, feed_id).await?))
}

async fn clear_logs_handler(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    state.engine.logger.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reconcile_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.engine.scheduler.reconcile_all().await?))
}
