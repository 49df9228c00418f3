use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::config::{AccessConfig, Capability, Principal};
use crate::dispatch::{Dispatcher, RunRequest, Submission};
use crate::error::{JobplaneError, Result};
use crate::pod::OrphanLedger;
use crate::store::models::{
    ApprovalState, ExecutionRequest, ExecutionResult, JobOverrides, LogEntry,
};

pub const PRINCIPAL_HEADER: &str = "x-jobplane-principal";
const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub approvals: Arc<ApprovalGate>,
    pub access: Arc<AccessConfig>,
    pub orphans: OrphanLedger,
    pub log_tail_lines: usize,
}

impl ApiState {
    fn principal(&self, headers: &HeaderMap) -> Principal {
        let name = headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS);
        self.access.principal(name)
    }
}

impl IntoResponse for JobplaneError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobplaneError::Validation(_)
            | JobplaneError::Configuration(_)
            | JobplaneError::JobDisabled(_) => StatusCode::BAD_REQUEST,
            JobplaneError::Forbidden(_) => StatusCode::FORBIDDEN,
            JobplaneError::NotFound(_) | JobplaneError::Load { .. } => StatusCode::NOT_FOUND,
            JobplaneError::Conflict(_) | JobplaneError::InvalidTransition(_) => {
                StatusCode::CONFLICT
            }
            JobplaneError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            JobplaneError::Validation(fields) => json!({
                "error": self.to_string(),
                "fields": fields,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub status: String,
}

impl From<Submission> for RunResponse {
    fn from(submission: Submission) -> Self {
        match submission {
            Submission::Started(result) => RunResponse {
                execution_result_id: Some(result.id),
                request_id: None,
                status: result.status.to_string(),
            },
            Submission::Deferred(request) => RunResponse {
                execution_result_id: None,
                request_id: Some(request.id),
                status: match request.approval {
                    ApprovalState::PendingApproval => request.approval.to_string(),
                    _ => "SCHEDULED".to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecutionView {
    #[serde(flatten)]
    result: ExecutionResult,
    log_tail: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
struct RequestView {
    #[serde(flatten)]
    request: ExecutionRequest,
    executions: Vec<ExecutionResult>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/run", post(run_handler))
        .route("/api/executions/:id", get(execution_handler))
        .route("/api/executions/:id/logs", get(logs_handler))
        .route("/api/executions/:id/cancel", post(cancel_handler))
        .route("/api/requests/:id", get(request_handler))
        .route("/api/requests/:id/approve", post(approve_handler))
        .route("/api/requests/:id/deny", post(deny_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/refresh", post(refresh_handler))
        .route("/api/jobs/:class_path/overrides", put(overrides_handler))
        .route("/api/orphans", get(orphans_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn run_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(run): Json<RunRequest>,
) -> Result<impl IntoResponse> {
    let principal = state.principal(&headers);
    let submission = state.dispatcher.submit(&principal, run).await?;
    Ok((StatusCode::CREATED, Json(RunResponse::from(submission))))
}

async fn execution_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::View)?;
    let store = state.dispatcher.store();
    let result = store
        .get_result(&id)
        .await
        .ok_or_else(|| JobplaneError::NotFound(format!("execution {}", id)))?;
    let log_tail = store.log_tail(&id, state.log_tail_lines).await;
    Ok(Json(ExecutionView { result, log_tail }))
}

async fn logs_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::View)?;
    let store = state.dispatcher.store();
    if store.get_result(&id).await.is_none() {
        return Err(JobplaneError::NotFound(format!("execution {}", id)));
    }
    Ok(Json(store.logs(&id).await))
}

async fn cancel_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let principal = state.principal(&headers);
    Ok(Json(state.dispatcher.cancel(&principal, &id).await?))
}

async fn request_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::View)?;
    let store = state.dispatcher.store();
    let request = store
        .get_request(&id)
        .await
        .ok_or_else(|| JobplaneError::NotFound(format!("execution request {}", id)))?;
    let executions = store.results_for_request(&id).await;
    Ok(Json(RequestView {
        request,
        executions,
    }))
}

async fn approve_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let principal = state.principal(&headers);
    Ok(Json(state.approvals.approve(&principal, &id).await?))
}

async fn deny_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let principal = state.principal(&headers);
    Ok(Json(state.approvals.deny(&principal, &id).await?))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::View)?;
    Ok(Json(state.dispatcher.store().list_jobs().await))
}

async fn refresh_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::ManageJobs)?;
    Ok(Json(state.dispatcher.registry().refresh().await?))
}

async fn overrides_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(class_path): Path<String>,
    Json(overrides): Json<JobOverrides>,
) -> Result<impl IntoResponse> {
    let principal = state.principal(&headers);
    principal.require(Capability::ManageJobs)?;
    let record = state
        .dispatcher
        .store()
        .set_job_overrides(&class_path, overrides)
        .await?;
    tracing::info!(class_path = %class_path, principal = %principal.name, "Job overrides updated");
    Ok(Json(record))
}

async fn orphans_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    state.principal(&headers).require(Capability::View)?;
    Ok(Json(state.orphans.list().await))
}
