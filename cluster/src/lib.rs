//! Clúster local: coordinador + N workers en el mismo proceso, con
//! arranque y apagado acotados en tiempo.

use common::{JobGraph, JobResult};
use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::{
    FaultPolicy, InvokableRegistry, NoFaults, WorkerAgent, WorkerConfig, WorkerError,
};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Por worker: el arranque espera hasta N veces esto.
pub const STARTUP_TIMEOUT_PER_WORKER: Duration = Duration::from_millis(2000);
/// Cota para esperar a cada componente al apagar.
pub const JOIN_BOUND: Duration = Duration::from_millis(2000);

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("sólo {registered} de {expected} workers se registraron en {waited_ms} ms")]
    StartupTimeout {
        expected: usize,
        registered: usize,
        waited_ms: u64,
    },
    #[error("el clúster no terminó de apagarse a tiempo")]
    ShutdownTimeout,
    #[error("el clúster no está corriendo")]
    NotRunning,
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub coordinator: CoordinatorConfig,
    /// Plantilla para cada worker; la dirección del coordinador se pisa.
    pub worker: WorkerConfig,

    #[serde(with = "common::config::millis")]
    pub poll_interval: Duration,
    #[serde(with = "common::config::millis")]
    pub startup_timeout_per_worker: Duration,
    #[serde(with = "common::config::millis")]
    pub join_bound: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            ..CoordinatorConfig::default()
        };
        Self {
            coordinator,
            worker: WorkerConfig::default(),
            poll_interval: POLL_INTERVAL,
            startup_timeout_per_worker: STARTUP_TIMEOUT_PER_WORKER,
            join_bound: JOIN_BOUND,
        }
    }
}

struct Running {
    coordinator: CoordinatorHandle,
    workers: Vec<WorkerAgent>,
}

pub struct LocalCluster {
    config: ClusterConfig,
    registry: Arc<InvokableRegistry>,
    faults: Vec<Arc<dyn FaultPolicy>>,
    running: Option<Running>,
}

impl LocalCluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            registry: Arc::new(InvokableRegistry::with_builtins()),
            faults: Vec::new(),
            running: None,
        }
    }

    /// Registro compartido por todos los workers.
    pub fn with_registry(mut self, registry: Arc<InvokableRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Política de fallas del worker `index`; los demás usan `NoFaults`.
    pub fn with_fault_policy(mut self, index: usize, policy: Arc<dyn FaultPolicy>) -> Self {
        if self.faults.len() <= index {
            self.faults.resize_with(index + 1, || Arc::new(NoFaults));
        }
        self.faults[index] = policy;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.running.as_ref().map(|r| r.coordinator.coordinator())
    }

    pub fn coordinator_url(&self) -> Option<String> {
        self.running.as_ref().map(|r| r.coordinator.url())
    }

    pub fn workers(&self) -> &[WorkerAgent] {
        self.running
            .as_ref()
            .map(|r| r.workers.as_slice())
            .unwrap_or(&[])
    }

    fn fault_for(&self, index: usize) -> Arc<dyn FaultPolicy> {
        self.faults
            .get(index)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoFaults))
    }

    /// Levanta el coordinador y `n` workers y espera a que los `n` se
    /// registren, hasta `n` veces `startup_timeout_per_worker`. Si no llegan
    /// se baja lo que se levantó. Con el clúster corriendo no hace nada.
    pub async fn start(&mut self, n: usize) -> Result<(), ClusterError> {
        if self.running.is_some() {
            info!("el clúster ya está corriendo");
            return Ok(());
        }

        // 1) coordinador
        let coordinator = coordinator::spawn(self.config.coordinator.clone()).await?;
        let mut running = Running {
            coordinator,
            workers: Vec::with_capacity(n),
        };

        // 2) workers
        for i in 0..n {
            let config = WorkerConfig {
                coordinator_addr: running.coordinator.local_addr(),
                workers_per_process: n,
                ..self.config.worker.clone()
            };

            // un kill baja sólo a este worker, no al proceso
            let kill = CancellationToken::new();
            let k = kill.clone();
            let started = WorkerAgent::builder(config)
                .registry(Arc::clone(&self.registry))
                .fault_policy(self.fault_for(i))
                .terminator(Arc::new(move || k.cancel()))
                .start()
                .await;

            match started {
                Ok(agent) => {
                    let a = agent.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = kill.cancelled() => a.shutdown().await,
                            _ = a.stopped() => {}
                        }
                    });
                    running.workers.push(agent);
                }
                Err(e) => {
                    warn!("no arrancó el worker #{}: {}", i, e);
                    let _ = self.teardown(running).await;
                    return Err(e.into());
                }
            }
        }

        // 3) esperar registros
        let budget = self.config.startup_timeout_per_worker * n as u32;
        let started_at = Instant::now();
        loop {
            let registered = running.coordinator.coordinator().registered_workers();
            if registered >= n {
                break;
            }
            if started_at.elapsed() >= budget {
                warn!(
                    "timeout de arranque: {} de {} workers registrados",
                    registered, n
                );
                let _ = self.teardown(running).await;
                return Err(ClusterError::StartupTimeout {
                    expected: n,
                    registered,
                    waited_ms: started_at.elapsed().as_millis() as u64,
                });
            }
            sleep(self.config.poll_interval).await;
        }

        info!(
            "clúster local listo: {} workers contra {}",
            n,
            running.coordinator.url()
        );
        self.running = Some(running);
        Ok(())
    }

    /// Apaga workers y coordinador. Después de llamarlo el clúster no está
    /// corriendo, aunque haya vencido alguna cota. Sin clúster no hace nada.
    pub async fn stop(&mut self) -> Result<(), ClusterError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        self.teardown(running).await
    }

    async fn teardown(&self, running: Running) -> Result<(), ClusterError> {
        let Running {
            coordinator,
            workers,
        } = running;
        let mut timed_out = false;

        // 1) avisar y esperar a cada worker
        for (i, w) in workers.iter().enumerate() {
            if tokio::time::timeout(self.config.join_bound, w.shutdown())
                .await
                .is_err()
            {
                warn!("el worker #{} no terminó en {:?}", i, self.config.join_bound);
                timed_out = true;
            }
        }

        // 2) todos apagados de verdad o vence el presupuesto
        let budget = self.config.join_bound * workers.len() as u32;
        let started_at = Instant::now();
        while !workers.iter().all(|w| w.is_shut_down()) {
            if started_at.elapsed() >= budget {
                timed_out = true;
                break;
            }
            sleep(self.config.poll_interval).await;
        }

        // 3) coordinador
        if !coordinator.stop(self.config.join_bound).await {
            timed_out = true;
        }

        if timed_out {
            return Err(ClusterError::ShutdownTimeout);
        }
        info!("clúster local apagado");
        Ok(())
    }

    /// Manda el job al coordinador y espera el resultado.
    pub async fn submit_job(&self, graph: JobGraph) -> Result<JobResult, ClusterError> {
        let running = self.running.as_ref().ok_or(ClusterError::NotRunning)?;
        Ok(running.coordinator.coordinator().submit_job(graph).await?)
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}
