use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::QueueError;
use crate::scheduler::assigner::DequeueResult;
use crate::scheduler::bucket::{JobId, WorkerId};
use crate::scheduler::job::{JobResults, JobState};
use crate::server::connection::{
    DequeueRequest, ErrorBody, QueueStateReport, RegisterWorkerRequest, ReportAliveRequest,
    ReportResultOutcome, ReportResultRequest, ScheduleTestsRequest, ScheduleTestsResponse,
    WorkerConfiguration,
};
use crate::server::queue_server::QueueServer;
use crate::worker::aliveness::WorkerStatusReport;

impl QueueError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
            QueueError::JobDeleted(_) => StatusCode::GONE,
            QueueError::EmptyBucket | QueueError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            QueueError::WorkerBlocked(_) => StatusCode::FORBIDDEN,
            QueueError::Coordination(_) | QueueError::Deployment(_) => StatusCode::BAD_GATEWAY,
            QueueError::Transport(_) | QueueError::Remote { .. } => StatusCode::BAD_GATEWAY,
            QueueError::RetryExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Execution(_) | QueueError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, QueueError>;

pub fn router(server: Arc<QueueServer>) -> Router {
    Router::new()
        .route("/api/jobs", post(schedule_tests_handler))
        .route("/api/jobs/:job_id/state", get(job_state_handler))
        .route("/api/jobs/:job_id/results", get(job_results_handler))
        .route("/api/jobs/:job_id", delete(delete_job_handler))
        .route("/api/workers", get(worker_statuses_handler))
        .route("/api/workers/register", post(register_worker_handler))
        .route("/api/workers/dequeue", post(dequeue_handler))
        .route("/api/workers/alive", post(report_alive_handler))
        .route("/api/workers/result", post(report_result_handler))
        .route("/api/workers/:worker_id/block", post(block_worker_handler))
        .route("/api/queue", get(queue_state_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    server: Arc<QueueServer>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, server, shutdown).await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    server: Arc<QueueServer>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Queue server listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn schedule_tests_handler(
    State(server): State<Arc<QueueServer>>,
    Json(request): Json<ScheduleTestsRequest>,
) -> ApiResult<Json<ScheduleTestsResponse>> {
    Ok(Json(server.schedule_tests(request).await?))
}

async fn job_state_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<JobState>> {
    Ok(Json(server.job_state(&job_id).await?))
}

async fn job_results_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<JobResults>> {
    Ok(Json(server.job_results(&job_id).await?))
}

async fn delete_job_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    server.delete_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_worker_handler(
    State(server): State<Arc<QueueServer>>,
    Json(request): Json<RegisterWorkerRequest>,
) -> ApiResult<Json<WorkerConfiguration>> {
    Ok(Json(server.register_worker(&request.worker_id).await?))
}

async fn dequeue_handler(
    State(server): State<Arc<QueueServer>>,
    Json(request): Json<DequeueRequest>,
) -> ApiResult<Json<DequeueResult>> {
    Ok(Json(
        server
            .dequeue_bucket(&request.worker_id, &request.capabilities)
            .await?,
    ))
}

async fn report_alive_handler(
    State(server): State<Arc<QueueServer>>,
    Json(request): Json<ReportAliveRequest>,
) -> ApiResult<StatusCode> {
    server
        .report_alive(&request.worker_id, request.bucket_ids_being_processed)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn report_result_handler(
    State(server): State<Arc<QueueServer>>,
    Json(request): Json<ReportResultRequest>,
) -> ApiResult<Json<ReportResultOutcome>> {
    Ok(Json(
        server
            .report_result(&request.worker_id, request.testing_result)
            .await?,
    ))
}

async fn block_worker_handler(
    State(server): State<Arc<QueueServer>>,
    Path(worker_id): Path<WorkerId>,
) -> StatusCode {
    server.block_worker(&worker_id).await;
    StatusCode::NO_CONTENT
}

async fn worker_statuses_handler(
    State(server): State<Arc<QueueServer>>,
) -> Json<Vec<WorkerStatusReport>> {
    Json(server.worker_statuses().await)
}

async fn queue_state_handler(State(server): State<Arc<QueueServer>>) -> Json<QueueStateReport> {
    Json(server.queue_state().await)
}
