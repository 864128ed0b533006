use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::http::{BUFFERS, HEALTH, INVALIDATE, KILL, TASKS, TASK_CANCEL};
use common::{
    BufferUtilization, ChannelId, RpcError, TaskCancelResult, TaskDeploymentDescriptor,
    TaskSubmissionResult, VertexId, WorkerProtocol,
};
use std::collections::HashSet;
use tower_http::trace::TraceLayer;

use crate::agent::WorkerAgent;

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn build_router(agent: WorkerAgent) -> Router {
    Router::new()
        .route(HEALTH, get(health))
        .route(TASKS, post(submit_tasks))
        .route(TASK_CANCEL, post(cancel_task))
        .route(INVALIDATE, post(invalidate_lookup_cache))
        .route(KILL, post(kill))
        .route(BUFFERS, get(buffer_utilization))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

fn internal(e: RpcError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_tasks(
    State(agent): State<WorkerAgent>,
    Json(tasks): Json<Vec<TaskDeploymentDescriptor>>,
) -> ApiResult<Json<Vec<TaskSubmissionResult>>> {
    agent.submit_tasks(tasks).await.map(Json).map_err(internal)
}

async fn cancel_task(
    State(agent): State<WorkerAgent>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskCancelResult>> {
    agent
        .cancel_task(&VertexId::from(id.as_str()))
        .await
        .map(Json)
        .map_err(internal)
}

async fn invalidate_lookup_cache(
    State(agent): State<WorkerAgent>,
    Json(channels): Json<Vec<ChannelId>>,
) -> ApiResult<StatusCode> {
    let channels: HashSet<ChannelId> = channels.into_iter().collect();
    agent
        .invalidate_lookup_cache_entries(channels)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kill(State(agent): State<WorkerAgent>) -> ApiResult<StatusCode> {
    agent.kill_agent_process().await.map_err(internal)?;
    Ok(StatusCode::ACCEPTED)
}

async fn buffer_utilization(
    State(agent): State<WorkerAgent>,
) -> ApiResult<Json<BufferUtilization>> {
    agent.report_buffer_utilization().await.map(Json).map_err(internal)
}
