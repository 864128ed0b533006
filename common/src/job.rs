use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::JobId;
use crate::state::JobStatus;

/// Resultado de un job terminado con éxito.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,

    /// Acumuladores sumados sobre todas las tareas del job.
    #[serde(default)]
    pub accumulators: BTreeMap<String, i64>,

    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    /// Descripción del primer fallo a nivel de tarea, si hubo.
    pub failure: Option<String>,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub running_tasks: u32,
    pub finished_tasks: u32,
    pub failed_tasks: u32,
    pub canceled_tasks: u32,
}
