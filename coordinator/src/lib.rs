//! Coordinador: recibe grafos de jobs, los reparte entre los workers
//! registrados y agrega los estados que estos reportan.

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
mod handlers;
pub mod monitor;
pub mod server;
mod state;

pub use config::CoordinatorConfig;
pub use connector::{HttpConnector, WorkerConnector};
pub use coordinator::Coordinator;
pub use error::CoordinatorError;
pub use server::{spawn, spawn_with, CoordinatorHandle};
