//! Worker: corre las tareas que le despliega el coordinador.

pub mod agent;
mod builtins;
pub mod channel;
pub mod config;
pub mod environment;
pub mod error;
pub mod fault;
mod handlers;
pub mod hardware;
pub mod invokable;
pub mod io;
pub mod memory;
pub mod net;
pub mod profiler;
pub mod task;

pub use agent::{Terminator, WorkerAgent, WorkerBuilder};
pub use config::WorkerConfig;
pub use environment::TaskContext;
pub use error::{TaskError, WorkerError};
pub use fault::{FailOnState, FaultPolicy, NoFaults, SilentHeartbeat};
pub use invokable::{Invokable, InvokableRegistry};
