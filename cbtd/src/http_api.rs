//! Ledger HTTP API.
//!
//! Runner routes:
//! - `POST /dispatch/` - lease the oldest queued job (200 + job, or 204)
//! - `GET|PUT /job/{id}/` - read or update job status
//! - `POST /job/{id}/lit/` - append a LIT result
//! - `POST /job/{id}/cts/` - append a CTS result (multipart, optional `dump` part)
//!
//! Operator routes:
//! - `POST /revision/` - register a revision
//! - `POST /job/` - enqueue an ad-hoc job
//! - `POST /job/{id}/cancel/` - requeue or skip a job
//! - `POST /dispatcher/run/` - create primary jobs now
//!
//! `/health` is the only unauthenticated route.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cbt_common::protocol::DUMP_PART;
use cbt_common::{
    CancelRequest, CtsSubmission, EnqueueJobRequest, ErrorCode, JobId, LitResult, RevisionBody,
    StatusUpdate,
};
use serde_json::json;
use tracing::{info, warn};

use crate::auth::{self, Caller};
use crate::config::{Credential, DaemonConfig};
use crate::dispatcher::Dispatcher;
use crate::dumps::DumpStore;
use crate::ledger::{Ledger, LedgerError, StatusChange};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub dispatcher: Arc<Dispatcher>,
    pub dumps: DumpStore,
    pub credentials: Vec<Credential>,
    pub max_upload_bytes: usize,
    pub version: &'static str,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, config: &DaemonConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&ledger),
            config.primary_groups(),
            config.dispatch_interval(),
        ));
        Self {
            ledger,
            dispatcher,
            dumps: DumpStore::new(&config.media_dir),
            credentials: config.credentials.clone(),
            max_upload_bytes: config.max_upload_bytes,
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
        }
    }
}

/// Handler errors, mapped onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden,
    Conflict(String),
    Internal(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::JobNotFound(_) | LedgerError::UnknownRevision(_) => {
                Self::NotFound(err.to_string())
            }
            LedgerError::NotCancellable { .. } => Self::Conflict(err.to_string()),
            LedgerError::Load { .. } | LedgerError::Persist { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "operator credentials required".to_string(),
            ),
            Self::Conflict(detail) => (StatusCode::CONFLICT, detail),
            Self::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a ledger write on the blocking pool; it may wait on disk.
async fn blocking<T: Send + 'static>(
    call: impl FnOnce() -> Result<T, LedgerError> + Send + 'static,
) -> ApiResult<T> {
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| ApiError::Internal(format!("ledger task failed: {e}")))?
        .map_err(ApiError::from)
}

fn require_operator(caller: &Caller) -> ApiResult<()> {
    if caller.operator {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Create the ledger router.
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let api = Router::new()
        .route("/dispatch/", post(dispatch_handler))
        .route("/job/", post(enqueue_handler))
        .route("/job/{id}/", get(get_job_handler).put(update_job_handler))
        .route("/job/{id}/lit/", post(lit_result_handler))
        .route(
            "/job/{id}/cts/",
            post(cts_result_handler).layer(DefaultBodyLimit::max(state.max_upload_bytes)),
        )
        .route("/job/{id}/cancel/", post(cancel_handler))
        .route("/revision/", post(revision_handler))
        .route("/dispatcher/run/", post(dispatcher_run_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_basic_auth,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .with_state(state)
}

/// Handler for `/health`.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "ledger": state.ledger.stats(),
    }))
}

/// Handler for `POST /dispatch/`.
async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Response> {
    let ledger = Arc::clone(&state.ledger);
    let leased = blocking(move || ledger.lease(&caller.name)).await?;
    Ok(match leased {
        Some(job) => Json(job.to_body()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let job = state.ledger.job(JobId(id))?;
    Ok(Json(job.to_body()).into_response())
}

async fn update_job_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<Response> {
    let ledger = Arc::clone(&state.ledger);
    let change = blocking(move || ledger.update_status(JobId(id), update)).await?;
    if let StatusChange::Ignored { job, requested } = &change {
        warn!(
            job_id = id,
            runner = %caller.name,
            current = job.status.code(),
            requested = requested.code(),
            "Ignoring status write outside the runner transitions"
        );
    }
    Ok(Json(change.job().to_body()).into_response())
}

async fn lit_result_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(result): Json<LitResult>,
) -> ApiResult<Response> {
    let ledger = Arc::clone(&state.ledger);
    let stored = result.clone();
    let result_id = blocking(move || ledger.add_lit_result(JobId(id), stored)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": result_id,
            "test_path": result.test_path,
            "passing": result.passing,
        })),
    )
        .into_response())
}

async fn cts_result_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let id = JobId(id);
    // Reject unknown jobs before storing any blob.
    state.ledger.job(id)?;

    let mut fields = HashMap::new();
    let mut dump = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == DUMP_PART {
            let file_name = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            dump = Some((file_name, bytes));
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            fields.insert(name, text);
        }
    }

    let submission =
        CtsSubmission::from_fields(&fields).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let dump_name = match dump {
        Some((file_name, bytes)) if !bytes.is_empty() => Some(
            state
                .dumps
                .store(file_name.as_deref(), &bytes)
                .await
                .map_err(|e| {
                    warn!(
                        error_code = %ErrorCode::DumpStoreFailed.code_string(),
                        job_id = %id,
                        "Failed to store dump: {}", e
                    );
                    ApiError::Internal(format!("failed to store dump: {e}"))
                })?,
        ),
        _ => None,
    };

    let ledger = Arc::clone(&state.ledger);
    let (stored, dump) = (submission.clone(), dump_name.clone());
    let result_id = blocking(move || ledger.add_cts_result(id, stored, dump)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": result_id,
            "test_category": submission.test_category,
            "test_name": submission.test_name,
            "passing": submission.passing,
            "timedout": submission.timedout,
            "dump": dump_name,
        })),
    )
        .into_response())
}

async fn revision_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RevisionBody>,
) -> ApiResult<Response> {
    require_operator(&caller)?;
    if body.hash.trim().is_empty() {
        return Err(ApiError::BadRequest("revision hash is empty".to_string()));
    }

    let hash = body.hash.clone();
    let ledger = Arc::clone(&state.ledger);
    let (created, revision) = blocking(move || {
        let created = ledger.upsert_revision(body)?;
        Ok((created, ledger.revision(&hash)))
    })
    .await?;
    let revision = revision.ok_or_else(|| ApiError::Internal("revision vanished".to_string()))?;
    if created {
        info!(revision = %revision.hash, "Revision registered");
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(revision)).into_response())
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<EnqueueJobRequest>,
) -> ApiResult<Response> {
    require_operator(&caller)?;
    let ledger = Arc::clone(&state.ledger);
    let job =
        blocking(move || ledger.enqueue(&request.revision_hash, request.groups, false)).await?;
    Ok((StatusCode::CREATED, Json(job.to_body())).into_response())
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Response> {
    require_operator(&caller)?;
    let ledger = Arc::clone(&state.ledger);
    let job = blocking(move || ledger.cancel(JobId(id), request.requeue)).await?;
    Ok(Json(job.to_body()).into_response())
}

async fn dispatcher_run_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Response> {
    require_operator(&caller)?;
    let dispatcher = Arc::clone(&state.dispatcher);
    let created = blocking(move || dispatcher.run_once()).await?;
    Ok(Json(json!({ "created": created })).into_response())
}

/// Bind and serve the ledger API.
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Ledger API listening on {}", addr);
    }
    axum::serve(listener, router).await
}
