use common::config::{env_millis, env_opt, env_parse};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_PAGE_SIZE: usize = 32 * 1024;
pub const DEFAULT_NUM_BUFFERS: usize = 2048;
/// Registros por batch en el plano de datos.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Dirección RPC del coordinador; también es el destino de la
    /// detección de dirección propia.
    pub coordinator_addr: SocketAddr,

    /// 0 = el sistema elige un puerto libre.
    pub rpc_port: u16,
    pub data_port: u16,

    /// Tamaño de memoria explícito en MiB; pisa lo detectado.
    pub memory_size_mb: Option<u64>,
    pub page_size: usize,

    pub tmp_dirs: Vec<PathBuf>,

    #[serde(with = "common::config::millis")]
    pub heartbeat_interval: Duration,

    pub profiling: bool,
    pub num_buffers: usize,
    pub buffer_size: usize,

    /// Cuántos workers comparten este proceso (clúster local).
    pub workers_per_process: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: DEFAULT_COORDINATOR_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080))),
            rpc_port: 0,
            data_port: 0,
            memory_size_mb: None,
            page_size: DEFAULT_PAGE_SIZE,
            tmp_dirs: vec![env::temp_dir()],
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            profiling: false,
            num_buffers: DEFAULT_NUM_BUFFERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            workers_per_process: 1,
        }
    }
}

impl WorkerConfig {
    /// Arma la config a partir de variables de entorno, con los defaults
    /// de arriba para lo que falte.
    pub fn from_env() -> Self {
        let d = Self::default();

        let tmp_dirs = env::var("WORKER_TMP_DIRS")
            .ok()
            .map(|s| {
                s.split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .filter(|dirs| !dirs.is_empty())
            .unwrap_or(d.tmp_dirs);

        Self {
            coordinator_addr: env_parse("COORDINATOR_ADDR", d.coordinator_addr),
            rpc_port: env_parse("WORKER_RPC_PORT", d.rpc_port),
            data_port: env_parse("WORKER_DATA_PORT", d.data_port),
            memory_size_mb: env_opt("WORKER_MEMORY_MB"),
            page_size: env_parse("WORKER_PAGE_SIZE", d.page_size),
            tmp_dirs,
            heartbeat_interval: env_millis("WORKER_HEARTBEAT_MS", d.heartbeat_interval),
            profiling: env_parse("WORKER_PROFILING", d.profiling),
            num_buffers: env_parse("WORKER_NUM_BUFFERS", d.num_buffers),
            buffer_size: env_parse("WORKER_BUFFER_SIZE", d.buffer_size),
            workers_per_process: d.workers_per_process,
        }
    }

    pub fn coordinator_url(&self) -> String {
        format!("http://{}", self.coordinator_addr)
    }
}
