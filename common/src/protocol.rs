use async_trait::async_trait;
use std::collections::HashSet;

use crate::channel::ChannelLookup;
use crate::dag::InputSplit;
use crate::ids::{ChannelId, JobId, VertexId};
use crate::task::{
    AccumulatorReport, TaskCancelResult, TaskDeploymentDescriptor, TaskExecutionState,
    TaskSubmissionResult,
};
use crate::worker::{BufferUtilization, Heartbeat};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("error de transporte: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("respuesta {status} de {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("respuesta inválida: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("el destino ya no está disponible")]
    Unavailable,
}

/// Lo que el coordinador expone a los workers.
#[async_trait]
pub trait CoordinatorProtocol: Send + Sync {
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RpcError>;

    async fn update_task_execution_state(&self, state: TaskExecutionState)
        -> Result<(), RpcError>;

    async fn get_next_input_split(
        &self,
        job_id: &JobId,
        vertex_id: &VertexId,
    ) -> Result<Option<InputSplit>, RpcError>;

    async fn lookup_channel(&self, channel_id: &ChannelId) -> Result<ChannelLookup, RpcError>;

    async fn report_accumulators(&self, report: AccumulatorReport) -> Result<(), RpcError>;
}

/// Lo que un worker expone al coordinador (y a quien envíe tareas).
#[async_trait]
pub trait WorkerProtocol: Send + Sync {
    async fn submit_tasks(
        &self,
        tasks: Vec<TaskDeploymentDescriptor>,
    ) -> Result<Vec<TaskSubmissionResult>, RpcError>;

    async fn cancel_task(&self, vertex_id: &VertexId) -> Result<TaskCancelResult, RpcError>;

    async fn invalidate_lookup_cache_entries(
        &self,
        channels: HashSet<ChannelId>,
    ) -> Result<(), RpcError>;

    /// Termina el proceso del worker después de una breve espera.
    async fn kill_agent_process(&self) -> Result<(), RpcError>;

    async fn report_buffer_utilization(&self) -> Result<BufferUtilization, RpcError>;
}
