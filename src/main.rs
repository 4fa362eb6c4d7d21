mod config;
mod control;
mod driver;
mod events;
mod http;
mod jobs;
mod metrics;
mod models;
mod orchestrator;
mod pipeline;
mod security;
mod session;
mod store;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{AppConfig, DriverKind};
use driver::{CapabilityDriver, DriverError, DriverFactory, LiveDriver, ScriptedDriver};
use eyre::WrapErr;
use jobs::{JobInfo, JobQueue};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ContextEntry, ContextId, ItemId, StartJobRequest};
use orchestrator::{Job, Orchestrator};
use pipeline::ItemPipeline;
use security::{AuthState, OperatorContext, require_operator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::CredentialFile;
use std::{net::SocketAddr, sync::Arc};
use store::{IdempotencyStore, StoreError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

const COMMAND_QUEUE_CAPACITY: usize = 16;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "reupload.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env()?;
    let store = IdempotencyStore::open(&config.db_path)
        .wrap_err_with(|| format!("open store {}", config.db_path.display()))?;
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("install prometheus recorder")?;

    let orchestrator = Orchestrator::new(
        ItemPipeline::new(config.session.step_timeout),
        store.clone(),
        config.retry.clone(),
    );
    let credentials = CredentialFile::new(&config.credentials_path);
    let (queue, _workers) = JobQueue::spawn(
        driver_factory(&config, credentials.clone()),
        orchestrator,
        credentials,
        COMMAND_QUEUE_CAPACITY,
    )
    .wrap_err("spawn worker")?;

    let state = AppState {
        queue,
        store,
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(
        state,
        AuthState::from_key_list(&config.operator_keys),
        config.request_max_bytes,
    );

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "reupload.api",
        driver = ?config.driver,
        db = %config.db_path.display(),
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn driver_factory(config: &AppConfig, credentials: CredentialFile) -> DriverFactory {
    match config.driver {
        DriverKind::Live => {
            let session = config.session.clone();
            Box::new(move || -> Result<Box<dyn CapabilityDriver>, DriverError> {
                Ok(Box::new(LiveDriver::launch(session.clone(), &credentials)?))
            })
        }
        DriverKind::Scripted => Box::new(|| -> Result<Box<dyn CapabilityDriver>, DriverError> {
            Ok(Box::new(ScriptedDriver::new()))
        }),
    }
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}))
}

#[derive(Clone)]
struct AppState {
    queue: JobQueue,
    store: IdempotencyStore,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/jobs", post(start_job))
        .route("/jobs/{id}", get(get_job_status))
        .route("/jobs/{id}/abort", post(abort_job))
        .route("/jobs/{id}/resume", post(resume_job))
        .route("/contexts", get(list_contexts).put(save_contexts))
        .route("/completions/{context}", get(list_completions))
        .route("/completions/{context}/bulk", post(bulk_complete))
        .route("/completions/{context}/{item}", get(completion_status))
        .route("/session/home", post(session_home))
        .route("/session/save", post(session_save))
        .route_layer(middleware::from_fn_with_state(auth, require_operator));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[derive(Debug)]
enum AppError {
    BadRequest { code: &'static str, detail: String },
    NotFound { code: &'static str },
    Store(StoreError),
    Worker(ApiError),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::BadRequest { code, detail } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: code.to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::NotFound { code } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: code.to_string(),
                    detail: None,
                },
            ),
            AppError::Store(err) => {
                error!(target = "reupload.store", error = %err, "store request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: "storage_failed".into(),
                        detail: Some(err.to_string()),
                    },
                )
            }
            AppError::Worker(err) => (StatusCode::SERVICE_UNAVAILABLE, err),
            AppError::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    error: "internal".into(),
                    detail: Some(detail),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

/// Runs a store call off the async runtime.
async fn with_store<T, F>(store: &IdempotencyStore, op: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&IdempotencyStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?
        .map_err(AppError::from)
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest {
        code: "invalid_job_id",
        detail: raw.to_string(),
    })
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "photo-reupload-rs",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StartJobResponse {
    job_id: String,
    items: usize,
}

/// Queue a re-upload run over an ordered item list.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Body: `{context_id, items, skip_completed}`
/// - Response: `202` with the job id
async fn start_job(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let Some((context, items, skip_completed)) = payload.normalized() else {
        return Err(AppError::BadRequest {
            code: "invalid_job",
            detail: "context_id and at least one item are required".into(),
        });
    };
    let job = Job::new(context, items, skip_completed);
    let count = job.items.len();
    info!(
        target = "reupload.api",
        operator = %operator.operator,
        key_id = %operator.key_id,
        job_id = %job.id,
        "job requested"
    );
    let id = state.queue.enqueue(job).await.map_err(AppError::Worker)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartJobResponse {
            job_id: id.to_string(),
            items: count,
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .get(id)
        .await
        .map(Json)
        .ok_or(AppError::NotFound { code: "job_not_found" })
}

async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/jobs/abort");
    let id = parse_job_id(&id)?;
    if state.queue.get(id).await.is_none() {
        return Err(AppError::NotFound { code: "job_not_found" });
    }
    let aborted = state.queue.abort(id).await;
    Ok(Json(json!({ "job_id": id.to_string(), "aborted": aborted })))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/jobs/resume");
    let id = parse_job_id(&id)?;
    if state.queue.get(id).await.is_none() {
        return Err(AppError::NotFound { code: "job_not_found" });
    }
    let resumed = state.queue.resume(id).await;
    Ok(Json(json!({ "job_id": id.to_string(), "resumed": resumed })))
}

async fn list_contexts(State(state): State<AppState>) -> Result<Json<Vec<ContextEntry>>, AppError> {
    with_store(&state.store, |store| store.load_context_cache())
        .await
        .map(Json)
}

async fn save_contexts(
    State(state): State<AppState>,
    Json(entries): Json<Vec<ContextEntry>>,
) -> Result<Json<serde_json::Value>, AppError> {
    if entries
        .iter()
        .any(|entry| entry.context_id.as_str().trim().is_empty())
    {
        return Err(AppError::BadRequest {
            code: "invalid_context",
            detail: "context_id must not be empty".into(),
        });
    }
    let saved = entries.len();
    with_store(&state.store, move |store| store.replace_context_cache(&entries)).await?;
    Ok(Json(json!({ "saved": saved })))
}

async fn list_completions(
    State(state): State<AppState>,
    Path(context): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let context = ContextId::new(context);
    let ctx = context.clone();
    let items = with_store(&state.store, move |store| store.completed_items(&ctx)).await?;
    Ok(Json(json!({ "context_id": context, "items": items })))
}

#[derive(Debug, Deserialize)]
struct BulkCompleteRequest {
    items: Vec<String>,
}

/// Mark items as already processed without running them.
async fn bulk_complete(
    State(state): State<AppState>,
    Path(context): Path<String>,
    Json(payload): Json<BulkCompleteRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let context = ContextId::new(context.trim());
    let items: Vec<ItemId> = payload
        .items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(ItemId::new)
        .collect();
    let submitted = items.len();
    let recorded =
        with_store(&state.store, move |store| store.bulk_record(&context, &items)).await?;
    Ok(Json(json!({ "submitted": submitted, "recorded": recorded })))
}

async fn completion_status(
    State(state): State<AppState>,
    Path((context, item)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let context = ContextId::new(context);
    let item = ItemId::new(item);
    let (ctx, it) = (context.clone(), item.clone());
    let completed = with_store(&state.store, move |store| store.is_completed(&ctx, &it)).await?;
    Ok(Json(json!({
        "context_id": context,
        "item_id": item,
        "completed": completed,
    })))
}

async fn session_home(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.queue.open_home().await.map_err(AppError::Worker)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn session_save(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let saved = state.queue.save_session().await.map_err(AppError::Worker)?;
    Ok(Json(json!({ "saved": saved })))
}
