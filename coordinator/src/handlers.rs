use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::http::{
    ACCUMULATORS, CHANNEL, HEALTH, HEARTBEAT, JOB, JOBS, NEXT_SPLIT, TASK_STATE, WORKERS,
};
use common::http::NextSplitRequest;
use common::{
    AccumulatorReport, ChannelId, ChannelLookup, Heartbeat, InputSplit, JobGraph, JobId, JobInfo,
    TaskExecutionState, WorkerMetrics,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn build_router(coordinator: Coordinator) -> Router {
    Router::new()
        .route(HEALTH, get(health))
        .route(JOBS, post(create_job).get(list_jobs))
        .route(JOB, get(get_job).delete(cancel_job))
        .route(WORKERS, get(list_workers))
        .route(HEARTBEAT, post(worker_heartbeat))
        .route(TASK_STATE, post(task_state))
        .route(NEXT_SPLIT, post(next_split))
        .route(CHANNEL, get(lookup_channel))
        .route(ACCUMULATORS, post(accumulators))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

fn status_of(e: &CoordinatorError) -> StatusCode {
    match e {
        CoordinatorError::InvalidJobGraph(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::UnknownJob(_) => StatusCode::NOT_FOUND,
        CoordinatorError::NoWorkers | CoordinatorError::ShutDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: CoordinatorError) -> (StatusCode, String) {
    (status_of(&e), e.to_string())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Acepta el grafo y despliega; el estado se consulta con GET /jobs/:id
async fn create_job(
    State(coordinator): State<Coordinator>,
    Json(graph): Json<JobGraph>,
) -> ApiResult<(StatusCode, Json<JobInfo>)> {
    let job_id = coordinator.start_job(graph).map_err(reject)?;
    let info = coordinator
        .job(&job_id)
        .ok_or_else(|| reject(CoordinatorError::UnknownJob(job_id.clone())))?;
    info!("job {} creado vía HTTP", job_id);
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_jobs(State(coordinator): State<Coordinator>) -> Json<Vec<JobInfo>> {
    Json(coordinator.jobs())
}

async fn get_job(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobInfo>> {
    let job_id = JobId::from(id.as_str());
    coordinator
        .job(&job_id)
        .map(Json)
        .ok_or_else(|| reject(CoordinatorError::UnknownJob(job_id)))
}

async fn cancel_job(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    coordinator
        .cancel_job(&JobId::from(id.as_str()))
        .map_err(reject)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_workers(State(coordinator): State<Coordinator>) -> Json<Vec<WorkerMetrics>> {
    Json(coordinator.workers())
}

async fn worker_heartbeat(
    State(coordinator): State<Coordinator>,
    Json(hb): Json<Heartbeat>,
) -> StatusCode {
    coordinator.heartbeat(hb);
    StatusCode::NO_CONTENT
}

async fn task_state(
    State(coordinator): State<Coordinator>,
    Json(update): Json<TaskExecutionState>,
) -> StatusCode {
    coordinator.update_task_execution_state(update);
    StatusCode::NO_CONTENT
}

async fn next_split(
    State(coordinator): State<Coordinator>,
    Json(req): Json<NextSplitRequest>,
) -> Json<Option<InputSplit>> {
    Json(coordinator.next_input_split(&req.job_id, &req.vertex_id))
}

async fn lookup_channel(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> Json<ChannelLookup> {
    Json(coordinator.lookup_channel(&ChannelId::from(id.as_str())))
}

async fn accumulators(
    State(coordinator): State<Coordinator>,
    Json(report): Json<AccumulatorReport>,
) -> StatusCode {
    coordinator.report_accumulators(report);
    StatusCode::NO_CONTENT
}
