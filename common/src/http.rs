//! Clientes HTTP (reqwest) de los protocolos del coordinador y del worker.
//! Las rutas se comparten con los routers axum de cada lado.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::channel::ChannelLookup;
use crate::dag::InputSplit;
use crate::ids::{ChannelId, JobId, VertexId};
use crate::protocol::{CoordinatorProtocol, RpcError, WorkerProtocol};
use crate::task::{
    AccumulatorReport, TaskCancelResult, TaskDeploymentDescriptor, TaskExecutionState,
    TaskSubmissionResult,
};
use crate::worker::{BufferUtilization, Heartbeat};

/* ---------------- rutas ---------------- */

pub const HEALTH: &str = "/health";

pub const JOBS: &str = "/api/v1/jobs";
pub const JOB: &str = "/api/v1/jobs/:id";
pub const WORKERS: &str = "/api/v1/workers";
pub const HEARTBEAT: &str = "/api/v1/workers/heartbeat";
pub const TASK_STATE: &str = "/api/v1/tasks/state";
pub const NEXT_SPLIT: &str = "/api/v1/splits/next";
pub const CHANNEL: &str = "/api/v1/channels/:id";
pub const ACCUMULATORS: &str = "/api/v1/accumulators";

pub const TASKS: &str = "/api/v1/tasks";
pub const TASK_CANCEL: &str = "/api/v1/tasks/:id/cancel";
pub const INVALIDATE: &str = "/api/v1/channels/invalidate";
pub const KILL: &str = "/api/v1/kill";
pub const BUFFERS: &str = "/api/v1/buffers";

/// Timeout por defecto de cada request.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextSplitRequest {
    pub job_id: JobId,
    pub vertex_id: VertexId,
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn check(url: &str, res: Response) -> Result<Response, RpcError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(RpcError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(url: &str, res: Response) -> Result<T, RpcError> {
    let res = check(url, res).await?;
    let bytes = res.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/* ---------------- coordinador ---------------- */

#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    base_url: String,
    client: Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(timeout),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CoordinatorProtocol for HttpCoordinatorClient {
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RpcError> {
        let url = self.url(HEARTBEAT);
        let res = self.client.post(&url).json(&heartbeat).send().await?;
        check(&url, res).await?;
        Ok(())
    }

    async fn update_task_execution_state(
        &self,
        state: TaskExecutionState,
    ) -> Result<(), RpcError> {
        let url = self.url(TASK_STATE);
        let res = self.client.post(&url).json(&state).send().await?;
        check(&url, res).await?;
        Ok(())
    }

    async fn get_next_input_split(
        &self,
        job_id: &JobId,
        vertex_id: &VertexId,
    ) -> Result<Option<InputSplit>, RpcError> {
        let url = self.url(NEXT_SPLIT);
        let req = NextSplitRequest {
            job_id: job_id.clone(),
            vertex_id: vertex_id.clone(),
        };
        let res = self.client.post(&url).json(&req).send().await?;
        decode(&url, res).await
    }

    async fn lookup_channel(&self, channel_id: &ChannelId) -> Result<ChannelLookup, RpcError> {
        let url = self.url(&CHANNEL.replace(":id", channel_id.as_str()));
        let res = self.client.get(&url).send().await?;
        decode(&url, res).await
    }

    async fn report_accumulators(&self, report: AccumulatorReport) -> Result<(), RpcError> {
        let url = self.url(ACCUMULATORS);
        let res = self.client.post(&url).json(&report).send().await?;
        check(&url, res).await?;
        Ok(())
    }
}

/* ---------------- worker ---------------- */

#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    base_url: String,
    client: Client,
}

impl HttpWorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(timeout),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl WorkerProtocol for HttpWorkerClient {
    async fn submit_tasks(
        &self,
        tasks: Vec<TaskDeploymentDescriptor>,
    ) -> Result<Vec<TaskSubmissionResult>, RpcError> {
        let url = self.url(TASKS);
        let res = self.client.post(&url).json(&tasks).send().await?;
        decode(&url, res).await
    }

    async fn cancel_task(&self, vertex_id: &VertexId) -> Result<TaskCancelResult, RpcError> {
        let url = self.url(&TASK_CANCEL.replace(":id", vertex_id.as_str()));
        let res = self.client.post(&url).send().await?;
        decode(&url, res).await
    }

    async fn invalidate_lookup_cache_entries(
        &self,
        channels: HashSet<ChannelId>,
    ) -> Result<(), RpcError> {
        let url = self.url(INVALIDATE);
        let body: Vec<ChannelId> = channels.into_iter().collect();
        let res = self.client.post(&url).json(&body).send().await?;
        check(&url, res).await?;
        Ok(())
    }

    async fn kill_agent_process(&self) -> Result<(), RpcError> {
        let url = self.url(KILL);
        let res = self.client.post(&url).send().await?;
        check(&url, res).await?;
        Ok(())
    }

    async fn report_buffer_utilization(&self) -> Result<BufferUtilization, RpcError> {
        let url = self.url(BUFFERS);
        let res = self.client.get(&url).send().await?;
        decode(&url, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let c = HttpCoordinatorClient::new("http://127.0.0.1:8080/");
        assert_eq!(c.url(HEARTBEAT), "http://127.0.0.1:8080/api/v1/workers/heartbeat");
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_a_transport_error() {
        // puerto 1: nadie escucha
        let c = HttpCoordinatorClient::with_timeout("http://127.0.0.1:1", Duration::from_millis(500));
        let err = c
            .lookup_channel(&ChannelId::from("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
