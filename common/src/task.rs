use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{ChannelId, JobId, VertexId};
use crate::state::ExecutionState;

/// Un extremo de un canal visto desde la tarea: el canal y el vértice
/// del otro lado.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateDescriptor {
    pub channel_id: ChannelId,
    pub peer: VertexId,
}

/// Todo lo que un worker necesita para instanciar una tarea.
/// Lo arma el coordinador y se consume una sola vez.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub vertex_id: VertexId,
    pub task_name: String,
    pub invokable: String,

    #[serde(default)]
    pub task_config: Value,
    #[serde(default)]
    pub job_config: Value,

    /// Gates de entrada y salida, en orden.
    #[serde(default)]
    pub inputs: Vec<GateDescriptor>,
    #[serde(default)]
    pub outputs: Vec<GateDescriptor>,

    #[serde(default)]
    pub memory_pages: usize,
}

impl TaskDeploymentDescriptor {
    /// `profile` en la config del job; por defecto activado.
    pub fn profiling_requested(&self) -> bool {
        self.job_config
            .get("profile")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Success,
    DeploymentError,
    InsufficientResources,
    /// Ya existe una tarea viva con ese id. Se acepta el nombre viejo
    /// `TASK_NOT_FOUND` al deserializar.
    #[serde(alias = "TASK_NOT_FOUND")]
    DuplicateTask,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSubmissionResult {
    pub vertex_id: VertexId,
    pub code: ReturnCode,
    pub description: Option<String>,
}

impl TaskSubmissionResult {
    pub fn success(vertex_id: VertexId) -> Self {
        Self {
            vertex_id,
            code: ReturnCode::Success,
            description: None,
        }
    }

    pub fn error(vertex_id: VertexId, code: ReturnCode, description: impl Into<String>) -> Self {
        Self {
            vertex_id,
            code,
            description: Some(description.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCancelResult {
    pub vertex_id: VertexId,
    pub code: ReturnCode,
    pub description: Option<String>,
}

/// Notificación de cambio de estado de una tarea (worker -> coordinador).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecutionState {
    pub job_id: JobId,
    pub vertex_id: VertexId,
    pub state: ExecutionState,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccumulatorReport {
    pub job_id: JobId,
    pub vertex_id: VertexId,
    pub values: BTreeMap<String, i64>,
}
