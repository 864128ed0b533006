use common::{GraphError, JobId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("grafo de job inválido: {0}")]
    InvalidJobGraph(String),
    #[error("no hay workers registrados")]
    NoWorkers,
    /// `description` es la del primer fallo de tarea, tal cual.
    #[error("el job {job_id} falló: {description}")]
    JobFailed { job_id: JobId, description: String },
    #[error("el job {0} fue cancelado")]
    JobCanceled(JobId),
    #[error("job desconocido: {0}")]
    UnknownJob(JobId),
    #[error("el coordinador se está apagando")]
    ShutDown,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GraphError> for CoordinatorError {
    fn from(e: GraphError) -> Self {
        CoordinatorError::InvalidJobGraph(e.to_string())
    }
}
