use common::{ReturnCode, RpcError};
use std::net::SocketAddr;
use thiserror::Error;

/// Errores fatales del worker (arranque y apagado).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no se pudo detectar la dirección propia para llegar a {coordinator}")]
    AddressDetection { coordinator: SocketAddr },
    #[error("directorio temporal #{index} {reason}")]
    ScratchDir { index: usize, reason: String },
    #[error("memoria: {0}")]
    Memory(String),
    #[error("no se pudo abrir {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("configuración inválida: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Errores a nivel de tarea.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("{0}")]
    Deployment(String),
    #[error("{0}")]
    InsufficientResources(String),
    #[error("la tarea {0} ya está corriendo")]
    DuplicateTask(String),
    #[error("{0}")]
    Execution(String),
    #[error("cancelada")]
    Cancelled,
    #[error("el hilo de la tarea terminó sin llegar a un estado final")]
    UnexpectedTermination,
}

impl TaskError {
    /// Código de retorno con que se informa un rechazo de despliegue.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            TaskError::InsufficientResources(_) => ReturnCode::InsufficientResources,
            TaskError::DuplicateTask(_) => ReturnCode::DuplicateTask,
            _ => ReturnCode::DeploymentError,
        }
    }
}
