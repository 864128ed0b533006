use async_trait::async_trait;
use chrono::Utc;
use common::{
    AccumulatorReport, ChannelId, ChannelLookup, CoordinatorProtocol, ExecutionState,
    GateDescriptor, Heartbeat, InputSplit, InstanceConnectionInfo, JobGraph, JobId, JobInfo,
    JobResult, JobStatus, ReturnCode, RpcError, TaskDeploymentDescriptor, TaskExecutionState,
    TaskSubmissionResult, VertexId, WorkerMetrics,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::connector::{HttpConnector, WorkerConnector};
use crate::error::CoordinatorError;
use crate::state::{JobRecord, VertexRecord, WorkerEntry};

/// Llamadas a workers que se hacen fuera de los locks.
enum Effect {
    Cancel {
        job_id: JobId,
        worker: InstanceConnectionInfo,
        vertex_id: VertexId,
    },
    Invalidate {
        worker: InstanceConnectionInfo,
        channels: HashSet<ChannelId>,
    },
}

/// Coordinador: tabla de workers, despliegue de jobs y agregación de
/// estados. Clonarlo es barato.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    connector: Arc<dyn WorkerConnector>,

    workers: Mutex<HashMap<InstanceConnectionInfo, WorkerEntry>>,
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
    /// canal -> job, para resolver lookups
    channels: RwLock<HashMap<ChannelId, JobId>>,

    shutdown: CancellationToken,
    is_shut_down: AtomicBool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let connector = Arc::new(HttpConnector::new(config.rpc_timeout));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: CoordinatorConfig, connector: Arc<dyn WorkerConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                workers: Mutex::new(HashMap::new()),
                jobs: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                is_shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down.load(Ordering::SeqCst)
    }

    /* ---------------- workers ---------------- */

    /// Registra o refresca al worker. Un worker dado por muerto que vuelve
    /// a mandar heartbeats revive.
    pub fn heartbeat(&self, hb: Heartbeat) {
        let mut workers = self.inner.workers.lock();
        match workers.get_mut(&hb.instance) {
            Some(entry) => {
                if entry.dead {
                    info!("worker {} revivió", hb.instance);
                    entry.dead = false;
                }
                entry.touch(&hb);
            }
            None => {
                info!(
                    "worker {} registrado ({}, {} cores, {} páginas libres)",
                    hb.instance, hb.hostname, hb.hardware.cpu_cores, hb.free_memory_pages
                );
                workers.insert(hb.instance.clone(), WorkerEntry::new(&hb));
            }
        }
    }

    /// Workers vivos.
    pub fn registered_workers(&self) -> usize {
        self.inner.workers.lock().values().filter(|w| !w.dead).count()
    }

    pub fn workers(&self) -> Vec<WorkerMetrics> {
        let now = Instant::now();
        let mut out: Vec<WorkerMetrics> = self
            .inner
            .workers
            .lock()
            .values()
            .map(|w| w.metrics(now))
            .collect();
        out.sort_by(|a, b| a.instance.cmp(&b.instance));
        out
    }

    fn alive_workers(&self) -> Vec<InstanceConnectionInfo> {
        let mut alive: Vec<_> = self
            .inner
            .workers
            .lock()
            .values()
            .filter(|w| !w.dead)
            .map(|w| w.instance.clone())
            .collect();
        alive.sort();
        alive
    }

    fn count_on_worker(&self, worker: &InstanceConnectionInfo, state: ExecutionState) {
        let mut workers = self.inner.workers.lock();
        if let Some(w) = workers.get_mut(worker) {
            match state {
                ExecutionState::Finished => w.tasks_finished += 1,
                ExecutionState::Failed => w.tasks_failed += 1,
                ExecutionState::Assigned => w.tasks_deployed += 1,
                _ => {}
            }
        }
    }

    /// Marca como muertos los workers sin heartbeat desde hace más de
    /// `worker_dead_timeout` y devuelve cuáles.
    pub(crate) fn mark_dead_workers(&self, now: Instant) -> Vec<InstanceConnectionInfo> {
        let timeout = self.inner.config.worker_dead_timeout;
        let mut dead = Vec::new();
        let mut workers = self.inner.workers.lock();
        for (id, w) in workers.iter_mut() {
            if !w.dead && now.saturating_duration_since(w.last_heartbeat) > timeout {
                w.dead = true;
                warn!("marcando worker {} como muerto", id);
                dead.push(id.clone());
            }
        }
        dead
    }

    /// Falla los vértices que corrían en workers muertos e invalida en los
    /// vivos las entradas de cache de los canales afectados.
    pub(crate) async fn handle_lost_workers(&self, lost: &[InstanceConnectionInfo]) {
        if lost.is_empty() {
            return;
        }
        let lost: HashSet<&InstanceConnectionInfo> = lost.iter().collect();
        let mut effects = Vec::new();
        let mut affected = HashSet::new();

        for job in self.job_records() {
            let mut job = job.lock();
            let on_lost: Vec<(VertexId, InstanceConnectionInfo)> = job
                .vertices
                .iter()
                .filter(|(_, v)| !v.state.is_terminal())
                .filter_map(|(id, v)| {
                    v.worker
                        .as_ref()
                        .filter(|w| lost.contains(w))
                        .map(|w| (id.clone(), w.clone()))
                })
                .collect();

            for (vertex_id, worker) in on_lost {
                for (channel, consumer) in &job.channels {
                    if consumer == &vertex_id {
                        affected.insert(channel.clone());
                    }
                }
                self.apply_state(
                    &mut job,
                    &vertex_id,
                    ExecutionState::Failed,
                    Some(format!("worker perdido: {}", worker)),
                    &mut effects,
                );
            }
        }

        if !affected.is_empty() {
            for worker in self.alive_workers() {
                effects.push(Effect::Invalidate {
                    worker,
                    channels: affected.clone(),
                });
            }
        }
        self.run_effects(effects);
    }

    /* ---------------- jobs ---------------- */

    fn job_record(&self, job_id: &JobId) -> Option<Arc<Mutex<JobRecord>>> {
        self.inner.jobs.read().get(job_id).cloned()
    }

    fn job_records(&self) -> Vec<Arc<Mutex<JobRecord>>> {
        self.inner.jobs.read().values().cloned().collect()
    }

    pub fn job(&self, job_id: &JobId) -> Option<JobInfo> {
        self.job_record(job_id).map(|j| j.lock().info())
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut out: Vec<JobInfo> = self.job_records().iter().map(|j| j.lock().info()).collect();
        out.sort_by_key(|j| j.submitted_at);
        out
    }

    /// Despliega el job y espera a que termine.
    pub async fn submit_job(&self, graph: JobGraph) -> Result<JobResult, CoordinatorError> {
        let job_id = self.start_job(graph)?;
        self.wait_job(&job_id).await
    }

    /// Valida el grafo, reparte los vértices entre los workers vivos y
    /// lanza el despliegue. No espera a que el job termine.
    pub fn start_job(&self, graph: JobGraph) -> Result<JobId, CoordinatorError> {
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }

        // 1) validación
        graph.validate()?;
        if self.inner.jobs.read().contains_key(&graph.job_id) {
            return Err(CoordinatorError::InvalidJobGraph(format!(
                "el job {} ya fue enviado",
                graph.job_id
            )));
        }

        // 2) splits
        let mut splits: HashMap<VertexId, VecDeque<InputSplit>> = HashMap::new();
        for v in &graph.vertices {
            let mut list: Vec<InputSplit> = v.splits.clone();
            if let Some(pattern) = &v.input_glob {
                let first = list.len() as u32;
                list.extend(expand_glob(pattern, first)?);
            }
            splits.insert(v.id.clone(), list.into());
        }

        // 3) reparto round-robin sobre los workers vivos
        let workers = self.alive_workers();
        if workers.is_empty() {
            return Err(CoordinatorError::NoWorkers);
        }

        let mut batches: BTreeMap<InstanceConnectionInfo, Vec<TaskDeploymentDescriptor>> =
            BTreeMap::new();
        let mut vertices = HashMap::new();

        for (i, v) in graph.vertices.iter().enumerate() {
            let worker = workers[i % workers.len()].clone();
            let tdd = TaskDeploymentDescriptor {
                job_id: graph.job_id.clone(),
                vertex_id: v.id.clone(),
                task_name: v.name.clone(),
                invokable: v.invokable.clone(),
                task_config: v.config.clone(),
                job_config: graph.config.clone(),
                inputs: graph
                    .inputs_of(&v.id)
                    .map(|e| GateDescriptor {
                        channel_id: e.channel_id.clone(),
                        peer: e.source.clone(),
                    })
                    .collect(),
                outputs: graph
                    .outputs_of(&v.id)
                    .map(|e| GateDescriptor {
                        channel_id: e.channel_id.clone(),
                        peer: e.target.clone(),
                    })
                    .collect(),
                memory_pages: v.memory_pages,
            };
            batches.entry(worker.clone()).or_default().push(tdd);

            vertices.insert(
                v.id.clone(),
                VertexRecord {
                    name: v.name.clone(),
                    state: ExecutionState::Scheduled,
                    worker: Some(worker),
                    deployed: false,
                    cancel_requested: false,
                    splits: splits.remove(&v.id).unwrap_or_default(),
                },
            );
        }

        let channels: HashMap<ChannelId, VertexId> = graph
            .edges
            .iter()
            .map(|e| (e.channel_id.clone(), e.target.clone()))
            .collect();

        // 4) registro del job
        let (done, _) = watch::channel(JobStatus::Running);
        let record = JobRecord {
            id: graph.job_id.clone(),
            name: graph.name.clone(),
            status: JobStatus::Running,
            vertices,
            channels: channels.clone(),
            accumulators: BTreeMap::new(),
            failure: None,
            submitted_at: Utc::now(),
            finished_at: None,
            started: Instant::now(),
            elapsed: None,
            done,
        };
        {
            let mut index = self.inner.channels.write();
            for channel in channels.keys() {
                index.insert(channel.clone(), graph.job_id.clone());
            }
        }
        self.inner
            .jobs
            .write()
            .insert(graph.job_id.clone(), Arc::new(Mutex::new(record)));

        info!(
            "job {} ({}) aceptado: {} tareas en {} workers",
            graph.name,
            graph.job_id,
            graph.vertices.len(),
            batches.len()
        );

        // 5) un lote por worker, en paralelo
        for (worker, tdds) in batches {
            let this = self.clone();
            let job_id = graph.job_id.clone();
            tokio::spawn(async move { this.deploy_batch(job_id, worker, tdds).await });
        }

        Ok(graph.job_id)
    }

    async fn deploy_batch(
        &self,
        job_id: JobId,
        worker: InstanceConnectionInfo,
        tdds: Vec<TaskDeploymentDescriptor>,
    ) {
        let Some(job) = self.job_record(&job_id) else {
            return;
        };

        // lo que ya terminó (job fallando) no se despliega
        let tdds: Vec<TaskDeploymentDescriptor> = {
            let mut job = job.lock();
            let mut keep = Vec::with_capacity(tdds.len());
            for tdd in tdds {
                if let Some(v) = job.vertices.get_mut(&tdd.vertex_id) {
                    if v.state == ExecutionState::Scheduled {
                        v.state = ExecutionState::Assigned;
                        keep.push(tdd);
                    }
                }
            }
            keep
        };
        if tdds.is_empty() {
            return;
        }

        debug!("desplegando {} tareas del job {} en {}", tdds.len(), job_id, worker);
        let ids: Vec<VertexId> = tdds.iter().map(|t| t.vertex_id.clone()).collect();
        let client = self.inner.connector.connect(&worker);

        match client.submit_tasks(tdds).await {
            Ok(results) => self.apply_submission(&job_id, &worker, results),
            Err(e) => {
                warn!("no se pudo desplegar en {}: {}", worker, e);
                let results = ids
                    .into_iter()
                    .map(|id| {
                        TaskSubmissionResult::error(
                            id,
                            ReturnCode::DeploymentError,
                            format!("no se pudo desplegar en {}: {}", worker, e),
                        )
                    })
                    .collect();
                self.apply_submission(&job_id, &worker, results);
            }
        }
    }

    fn apply_submission(
        &self,
        job_id: &JobId,
        worker: &InstanceConnectionInfo,
        results: Vec<TaskSubmissionResult>,
    ) {
        let Some(job) = self.job_record(job_id) else {
            return;
        };
        let mut effects = Vec::new();
        let mut deployed = 0;
        {
            let mut job = job.lock();
            let active = job.is_active();
            for r in results {
                if r.code == ReturnCode::Success {
                    deployed += 1;
                    let Some(v) = job.vertices.get_mut(&r.vertex_id) else {
                        continue;
                    };
                    v.deployed = true;
                    // el job falló mientras el lote viajaba
                    if !v.state.is_terminal() && (!active || v.cancel_requested) {
                        v.cancel_requested = true;
                        effects.push(Effect::Cancel {
                            job_id: job_id.clone(),
                            worker: worker.clone(),
                            vertex_id: r.vertex_id.clone(),
                        });
                    }
                } else {
                    let description = r
                        .description
                        .unwrap_or_else(|| format!("despliegue rechazado: {:?}", r.code));
                    self.apply_state(
                        &mut job,
                        &r.vertex_id,
                        ExecutionState::Failed,
                        Some(description),
                        &mut effects,
                    );
                }
            }
        }
        for _ in 0..deployed {
            self.count_on_worker(worker, ExecutionState::Assigned);
        }
        self.run_effects(effects);
    }

    /// Espera a que el job llegue a un estado final.
    pub async fn wait_job(&self, job_id: &JobId) -> Result<JobResult, CoordinatorError> {
        let job = self
            .job_record(job_id)
            .ok_or_else(|| CoordinatorError::UnknownJob(job_id.clone()))?;
        let mut rx = job.lock().done.subscribe();

        if rx.wait_for(|s| s.is_terminal()).await.is_err() {
            return Err(CoordinatorError::ShutDown);
        }

        let job = job.lock();
        match job.status {
            JobStatus::Finished => Ok(job.result()),
            JobStatus::Failed => Err(CoordinatorError::JobFailed {
                job_id: job.id.clone(),
                description: job.failure.clone().unwrap_or_default(),
            }),
            _ if self.is_shut_down() => Err(CoordinatorError::ShutDown),
            _ => Err(CoordinatorError::JobCanceled(job.id.clone())),
        }
    }

    /// Cancela todas las tareas del job. Cancelar un job terminado no hace nada.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), CoordinatorError> {
        let job = self
            .job_record(job_id)
            .ok_or_else(|| CoordinatorError::UnknownJob(job_id.clone()))?;
        let mut effects = Vec::new();
        {
            let mut job = job.lock();
            if job.status.is_terminal() {
                return Ok(());
            }
            info!("cancelando job {}", job_id);
            if job.is_active() {
                job.status = JobStatus::Canceling;
            }
            self.cancel_pending(&mut job, &mut effects);
            self.maybe_finish(&mut job, &mut effects);
        }
        self.run_effects(effects);
        Ok(())
    }

    /* ---------------- agregación ---------------- */

    /// Aplica un cambio de estado de un vértice y propaga sus efectos al
    /// job. Reportes para vértices ya terminados se ignoran.
    fn apply_state(
        &self,
        job: &mut JobRecord,
        vertex_id: &VertexId,
        state: ExecutionState,
        description: Option<String>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(v) = job.vertices.get_mut(vertex_id) else {
            debug!("estado para vértice desconocido {} del job {}", vertex_id, job.id);
            return;
        };
        if v.state.is_terminal() {
            debug!("reporte tardío para {} ({} -> {}), ignorado", vertex_id, v.state, state);
            return;
        }
        if state == ExecutionState::Canceling {
            return;
        }

        v.state = state;
        if matches!(state, ExecutionState::Running | ExecutionState::Finished) {
            v.deployed = true;
        }
        let worker = v.worker.clone();
        let name = v.name.clone();

        if let Some(w) = &worker {
            self.count_on_worker(w, state);
        }

        if state == ExecutionState::Failed && job.is_active() {
            let description = description.unwrap_or_else(|| format!("la tarea {} falló", name));
            warn!("job {}: falló {} ({}): {}", job.id, name, vertex_id, description);
            job.failure = Some(description);
            job.status = JobStatus::Failing;
            self.cancel_pending(job, effects);
        }

        self.maybe_finish(job, effects);
    }

    /// Cancela lo que sigue vivo: lo no desplegado pasa directo a
    /// CANCELED, lo desplegado recibe un pedido de cancelación.
    fn cancel_pending(&self, job: &mut JobRecord, effects: &mut Vec<Effect>) {
        let job_id = job.id.clone();
        for (id, v) in job.vertices.iter_mut() {
            if v.state.is_terminal() || v.cancel_requested {
                continue;
            }
            match v.state {
                ExecutionState::Created | ExecutionState::Scheduled => {
                    v.state = ExecutionState::Canceled;
                }
                _ => {
                    v.cancel_requested = true;
                    if let Some(worker) = &v.worker {
                        effects.push(Effect::Cancel {
                            job_id: job_id.clone(),
                            worker: worker.clone(),
                            vertex_id: id.clone(),
                        });
                    }
                }
            }
        }
    }

    fn maybe_finish(&self, job: &mut JobRecord, effects: &mut Vec<Effect>) {
        if job.status.is_terminal() || !job.all_terminal() {
            return;
        }

        let status = if job.failure.is_some() {
            JobStatus::Failed
        } else if job.status == JobStatus::Canceling
            || job
                .vertices
                .values()
                .any(|v| v.state == ExecutionState::Canceled)
        {
            JobStatus::Canceled
        } else {
            JobStatus::Finished
        };

        job.status = status;
        job.finished_at = Some(Utc::now());
        job.elapsed = Some(job.started.elapsed());
        let _ = job.done.send(status);

        info!(
            "job {} ({}) terminó: {:?} en {} ms",
            job.name,
            job.id,
            status,
            job.started.elapsed().as_millis()
        );

        // sacar los canales del índice e invalidar las caches que los tengan
        let channels: HashSet<ChannelId> = job.channels.keys().cloned().collect();
        if channels.is_empty() {
            return;
        }
        {
            let mut index = self.inner.channels.write();
            for c in &channels {
                index.remove(c);
            }
        }
        let hosts: HashSet<InstanceConnectionInfo> = job
            .vertices
            .values()
            .filter(|v| v.deployed)
            .filter_map(|v| v.worker.clone())
            .collect();
        for worker in hosts {
            effects.push(Effect::Invalidate {
                worker,
                channels: channels.clone(),
            });
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            let this = self.clone();
            match effect {
                Effect::Cancel {
                    job_id,
                    worker,
                    vertex_id,
                } => {
                    tokio::spawn(async move {
                        let client = this.inner.connector.connect(&worker);
                        if let Err(e) = client.cancel_task(&vertex_id).await {
                            // sin worker que confirme, se da por cancelada
                            warn!("no se pudo cancelar {} en {}: {}", vertex_id, worker, e);
                            this.force_state(&job_id, &vertex_id, ExecutionState::Canceled);
                        }
                    });
                }
                Effect::Invalidate { worker, channels } => {
                    tokio::spawn(async move {
                        let client = this.inner.connector.connect(&worker);
                        if let Err(e) = client.invalidate_lookup_cache_entries(channels).await {
                            debug!("no se pudo invalidar la cache de {}: {}", worker, e);
                        }
                    });
                }
            }
        }
    }

    fn force_state(&self, job_id: &JobId, vertex_id: &VertexId, state: ExecutionState) {
        let Some(job) = self.job_record(job_id) else {
            return;
        };
        let mut effects = Vec::new();
        self.apply_state(&mut job.lock(), vertex_id, state, None, &mut effects);
        self.run_effects(effects);
    }

    /* ---------------- protocolo con workers ---------------- */

    pub fn update_task_execution_state(&self, update: TaskExecutionState) {
        let Some(job) = self.job_record(&update.job_id) else {
            debug!("estado para job desconocido {}", update.job_id);
            return;
        };
        debug!("tarea {} -> {}", update.vertex_id, update.state);

        let mut effects = Vec::new();
        self.apply_state(
            &mut job.lock(),
            &update.vertex_id,
            update.state,
            update.description,
            &mut effects,
        );
        self.run_effects(effects);
    }

    pub fn next_input_split(&self, job_id: &JobId, vertex_id: &VertexId) -> Option<InputSplit> {
        let job = self.job_record(job_id)?;
        let mut job = job.lock();
        job.vertices.get_mut(vertex_id)?.splits.pop_front()
    }

    /// `Found` cuando el consumidor del canal ya está desplegado, `Pending`
    /// mientras tanto y `Unknown` si el canal no es de ningún job vivo.
    pub fn lookup_channel(&self, channel_id: &ChannelId) -> ChannelLookup {
        let Some(job_id) = self.inner.channels.read().get(channel_id).cloned() else {
            return ChannelLookup::Unknown;
        };
        let Some(job) = self.job_record(&job_id) else {
            return ChannelLookup::Unknown;
        };
        let job = job.lock();
        let Some(consumer) = job
            .channels
            .get(channel_id)
            .and_then(|v| job.vertices.get(v))
        else {
            return ChannelLookup::Unknown;
        };

        match (&consumer.worker, consumer.deployed) {
            (Some(worker), true) => ChannelLookup::Found(worker.clone()),
            _ if consumer.state.is_terminal() => ChannelLookup::Unknown,
            _ => ChannelLookup::Pending,
        }
    }

    pub fn report_accumulators(&self, report: AccumulatorReport) {
        let Some(job) = self.job_record(&report.job_id) else {
            return;
        };
        let mut job = job.lock();
        for (name, value) in report.values {
            *job.accumulators.entry(name).or_insert(0) += value;
        }
    }

    /* ---------------- apagado ---------------- */

    /// Cancela los jobs vivos y corta los loops de fondo. Idempotente.
    pub fn shutdown(&self) {
        if self.inner.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("apagando coordinador");

        let mut effects = Vec::new();
        for job in self.job_records() {
            let mut job = job.lock();
            if job.status.is_terminal() {
                continue;
            }
            if job.is_active() {
                job.status = JobStatus::Canceling;
            }
            self.cancel_pending(&mut job, &mut effects);
            for v in job.vertices.values_mut() {
                if !v.state.is_terminal() {
                    v.state = ExecutionState::Canceled;
                }
            }
            self.maybe_finish(&mut job, &mut effects);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            self.run_effects(effects);
        }
        self.inner.shutdown.cancel();
    }
}

/// Un split `{"path": ...}` por archivo que matchea, en orden.
fn expand_glob(pattern: &str, first: u32) -> Result<Vec<InputSplit>, CoordinatorError> {
    let entries = glob::glob(pattern).map_err(|e| {
        CoordinatorError::InvalidJobGraph(format!("patrón input_glob inválido {}: {}", pattern, e))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    Ok(files
        .into_iter()
        .enumerate()
        .map(|(i, path)| InputSplit {
            number: first + i as u32,
            payload: json!({ "path": path.to_string_lossy() }),
        })
        .collect())
}

#[async_trait]
impl CoordinatorProtocol for Coordinator {
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RpcError> {
        self.heartbeat(heartbeat);
        Ok(())
    }

    async fn update_task_execution_state(
        &self,
        state: TaskExecutionState,
    ) -> Result<(), RpcError> {
        Coordinator::update_task_execution_state(self, state);
        Ok(())
    }

    async fn get_next_input_split(
        &self,
        job_id: &JobId,
        vertex_id: &VertexId,
    ) -> Result<Option<InputSplit>, RpcError> {
        Ok(self.next_input_split(job_id, vertex_id))
    }

    async fn lookup_channel(&self, channel_id: &ChannelId) -> Result<ChannelLookup, RpcError> {
        Ok(Coordinator::lookup_channel(self, channel_id))
    }

    async fn report_accumulators(&self, report: AccumulatorReport) -> Result<(), RpcError> {
        Coordinator::report_accumulators(self, report);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::{
        BufferUtilization, HardwareDescription, JobVertex, TaskCancelResult, WorkerProtocol,
    };
    use std::time::Duration;

    /// Worker falso: acepta todo y guarda qué le pidieron.
    #[derive(Default)]
    pub(crate) struct FakeWorker {
        pub submitted: Mutex<Vec<TaskDeploymentDescriptor>>,
        pub cancelled: Mutex<Vec<VertexId>>,
        pub invalidated: Mutex<Vec<HashSet<ChannelId>>>,
        pub reject: Mutex<Option<(ReturnCode, String)>>,
    }

    #[async_trait]
    impl WorkerProtocol for FakeWorker {
        async fn submit_tasks(
            &self,
            tasks: Vec<TaskDeploymentDescriptor>,
        ) -> Result<Vec<TaskSubmissionResult>, RpcError> {
            let reject = self.reject.lock().clone();
            let results = tasks
                .iter()
                .map(|t| match &reject {
                    Some((code, desc)) => {
                        TaskSubmissionResult::error(t.vertex_id.clone(), *code, desc.clone())
                    }
                    None => TaskSubmissionResult::success(t.vertex_id.clone()),
                })
                .collect();
            self.submitted.lock().extend(tasks);
            Ok(results)
        }

        async fn cancel_task(&self, vertex_id: &VertexId) -> Result<TaskCancelResult, RpcError> {
            self.cancelled.lock().push(vertex_id.clone());
            Ok(TaskCancelResult {
                vertex_id: vertex_id.clone(),
                code: ReturnCode::Success,
                description: None,
            })
        }

        async fn invalidate_lookup_cache_entries(
            &self,
            channels: HashSet<ChannelId>,
        ) -> Result<(), RpcError> {
            self.invalidated.lock().push(channels);
            Ok(())
        }

        async fn kill_agent_process(&self) -> Result<(), RpcError> {
            Ok(())
        }

        async fn report_buffer_utilization(&self) -> Result<BufferUtilization, RpcError> {
            Ok(BufferUtilization::default())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub workers: Mutex<HashMap<InstanceConnectionInfo, Arc<FakeWorker>>>,
    }

    impl FakeConnector {
        pub fn worker(&self, instance: &InstanceConnectionInfo) -> Arc<FakeWorker> {
            self.workers
                .lock()
                .entry(instance.clone())
                .or_default()
                .clone()
        }
    }

    impl WorkerConnector for FakeConnector {
        fn connect(&self, instance: &InstanceConnectionInfo) -> Arc<dyn WorkerProtocol> {
            self.worker(instance)
        }
    }

    pub(crate) fn instance(port: u16) -> InstanceConnectionInfo {
        InstanceConnectionInfo {
            address: "127.0.0.1".parse().unwrap(),
            rpc_port: port,
            data_port: port + 1,
        }
    }

    pub(crate) fn heartbeat(port: u16) -> Heartbeat {
        Heartbeat {
            instance: instance(port),
            hostname: "test".into(),
            hardware: HardwareDescription {
                cpu_cores: 2,
                physical_memory: 1 << 30,
                usable_memory: 1 << 29,
            },
            running_tasks: 0,
            free_memory_pages: 16,
        }
    }

    pub(crate) fn coordinator() -> (Coordinator, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        let c = Coordinator::with_connector(CoordinatorConfig::default(), connector.clone());
        (c, connector)
    }

    fn two_stage_graph() -> (JobGraph, VertexId, VertexId, ChannelId) {
        let mut g = JobGraph::new("test");
        let src = g.add_vertex(JobVertex::new("src", "sequence_source"));
        let dst = g.add_vertex(JobVertex::new("dst", "discard_sink"));
        let ch = g.connect(&src, &dst);
        (g, src, dst, ch)
    }

    fn report(job: &JobId, v: &VertexId, state: ExecutionState, desc: Option<&str>) -> TaskExecutionState {
        TaskExecutionState {
            job_id: job.clone(),
            vertex_id: v.clone(),
            state,
            description: desc.map(str::to_string),
        }
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timeout esperando condición");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn heartbeat_registers_and_revives() {
        let (c, _) = coordinator();
        c.heartbeat(heartbeat(10));
        c.heartbeat(heartbeat(10));
        assert_eq!(c.registered_workers(), 1);

        let lost = c.mark_dead_workers(Instant::now() + Duration::from_secs(60));
        assert_eq!(lost, vec![instance(10)]);
        assert_eq!(c.registered_workers(), 0);

        c.heartbeat(heartbeat(10));
        assert_eq!(c.registered_workers(), 1);
        assert!(!c.workers()[0].dead);
    }

    #[tokio::test]
    async fn job_without_workers_is_rejected() {
        let (c, _) = coordinator();
        let (g, ..) = two_stage_graph();
        assert!(matches!(c.start_job(g), Err(CoordinatorError::NoWorkers)));
    }

    #[tokio::test]
    async fn vertices_are_spread_round_robin_with_gates_wired() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(20));
        c.heartbeat(heartbeat(10));
        let (g, src, dst, ch) = two_stage_graph();

        c.start_job(g).unwrap();
        wait_until(|| {
            conn.worker(&instance(10)).submitted.lock().len() == 1
                && conn.worker(&instance(20)).submitted.lock().len() == 1
        })
        .await;

        // ordenados por identidad: src al 10, dst al 20
        let first = conn.worker(&instance(10)).submitted.lock()[0].clone();
        let second = conn.worker(&instance(20)).submitted.lock()[0].clone();
        assert_eq!(first.vertex_id, src);
        assert_eq!(first.outputs[0].channel_id, ch);
        assert_eq!(second.vertex_id, dst);
        assert_eq!(second.inputs[0].peer, src);
    }

    #[tokio::test]
    async fn lookup_is_pending_until_consumer_is_deployed() {
        let (c, _) = coordinator();
        c.heartbeat(heartbeat(10));
        let (g, _, _, ch) = two_stage_graph();
        assert_eq!(c.lookup_channel(&ch), ChannelLookup::Unknown);

        c.start_job(g).unwrap();
        wait_until(|| c.lookup_channel(&ch) != ChannelLookup::Pending).await;
        assert_eq!(c.lookup_channel(&ch), ChannelLookup::Found(instance(10)));
    }

    #[tokio::test]
    async fn finished_job_merges_accumulators() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(10));
        let (g, src, dst, ch) = two_stage_graph();
        let job_id = c.start_job(g).unwrap();
        wait_until(|| conn.worker(&instance(10)).submitted.lock().len() == 2).await;

        for v in [&src, &dst] {
            c.update_task_execution_state(report(&job_id, v, ExecutionState::Running, None));
        }
        c.report_accumulators(AccumulatorReport {
            job_id: job_id.clone(),
            vertex_id: src.clone(),
            values: BTreeMap::from([("records".to_string(), 3)]),
        });
        c.report_accumulators(AccumulatorReport {
            job_id: job_id.clone(),
            vertex_id: dst.clone(),
            values: BTreeMap::from([("records".to_string(), 4)]),
        });
        for v in [&src, &dst] {
            c.update_task_execution_state(report(&job_id, v, ExecutionState::Finished, None));
        }

        let result = c.wait_job(&job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Finished);
        assert_eq!(result.accumulators.get("records"), Some(&7));

        // los canales del job ya no se resuelven
        assert_eq!(c.lookup_channel(&ch), ChannelLookup::Unknown);
        wait_until(|| !conn.worker(&instance(10)).invalidated.lock().is_empty()).await;
    }

    #[tokio::test]
    async fn first_failure_wins_and_cancels_the_rest() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(10));
        let (g, src, dst, _) = two_stage_graph();
        let job_id = c.start_job(g).unwrap();
        wait_until(|| conn.worker(&instance(10)).submitted.lock().len() == 2).await;
        wait_until(|| c.job(&job_id).map(|j| j.status) == Some(JobStatus::Running)).await;

        c.update_task_execution_state(report(&job_id, &src, ExecutionState::Running, None));
        c.update_task_execution_state(report(
            &job_id,
            &src,
            ExecutionState::Failed,
            Some("Worker #0 failed."),
        ));
        // fallos posteriores no pisan al primero
        c.update_task_execution_state(report(&job_id, &dst, ExecutionState::Failed, Some("canal roto")));
        // y reportes duplicados se ignoran
        c.update_task_execution_state(report(&job_id, &src, ExecutionState::Finished, None));

        match c.wait_job(&job_id).await {
            Err(CoordinatorError::JobFailed { description, .. }) => {
                assert_eq!(description, "Worker #0 failed.")
            }
            other => panic!("esperaba JobFailed, llegó {:?}", other.map(|r| r.status)),
        }
        wait_until(|| conn.worker(&instance(10)).cancelled.lock().contains(&dst)).await;
    }

    #[tokio::test]
    async fn deployment_rejection_fails_the_job_with_its_description() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(10));
        *conn.worker(&instance(10)).reject.lock() =
            Some((ReturnCode::DeploymentError, "invokable desconocido: x".into()));
        let (g, ..) = two_stage_graph();

        let err = c.submit_job(g).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::JobFailed { description, .. } if description == "invokable desconocido: x"
        ));
    }

    #[tokio::test]
    async fn cancel_job_ends_canceled() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(10));
        let (g, src, dst, _) = two_stage_graph();
        let job_id = c.start_job(g).unwrap();
        wait_until(|| conn.worker(&instance(10)).submitted.lock().len() == 2).await;

        c.cancel_job(&job_id).unwrap();
        wait_until(|| conn.worker(&instance(10)).cancelled.lock().len() == 2).await;
        for v in [&src, &dst] {
            c.update_task_execution_state(report(&job_id, v, ExecutionState::Canceled, None));
        }

        assert!(matches!(
            c.wait_job(&job_id).await,
            Err(CoordinatorError::JobCanceled(_))
        ));
        assert!(matches!(
            c.cancel_job(&JobId::new()),
            Err(CoordinatorError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn lost_worker_fails_its_vertices() {
        let (c, conn) = coordinator();
        c.heartbeat(heartbeat(10));
        c.heartbeat(heartbeat(20));
        let (g, _, dst, _) = two_stage_graph();
        let job_id = c.start_job(g).unwrap();
        wait_until(|| conn.worker(&instance(20)).submitted.lock().len() == 1).await;

        // sólo el 20 sigue mandando heartbeats
        let later = Instant::now() + Duration::from_secs(30);
        let lost = {
            let mut workers = c.inner.workers.lock();
            if let Some(w) = workers.get_mut(&instance(20)) {
                w.last_heartbeat = later;
            }
            drop(workers);
            c.mark_dead_workers(later)
        };
        assert_eq!(lost, vec![instance(10)]);
        c.handle_lost_workers(&lost).await;

        // el worker vivo confirma la cancelación de su parte
        wait_until(|| conn.worker(&instance(20)).cancelled.lock().contains(&dst)).await;
        c.update_task_execution_state(report(&job_id, &dst, ExecutionState::Canceled, None));

        let err = c.wait_job(&job_id).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::JobFailed { description, .. } if description.starts_with("worker perdido")
        ));
    }

    #[tokio::test]
    async fn next_split_drains_in_order_and_glob_expands_files() {
        let dir = std::env::temp_dir().join(format!("coord-glob-{}", JobId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["b.txt", "a.txt"] {
            std::fs::write(dir.join(name), "x").unwrap();
        }

        let (c, _) = coordinator();
        c.heartbeat(heartbeat(10));
        let mut g = JobGraph::new("splits");
        let v = g.add_vertex(
            JobVertex::new("src", "split_source")
                .with_input_glob(format!("{}/*.txt", dir.display())),
        );
        let job_id = c.start_job(g).unwrap();

        let first = c.next_input_split(&job_id, &v).unwrap();
        let second = c.next_input_split(&job_id, &v).unwrap();
        assert!(first.payload["path"].as_str().unwrap().ends_with("a.txt"));
        assert_eq!(second.number, 1);
        assert!(c.next_input_split(&job_id, &v).is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_new_jobs() {
        let (c, _) = coordinator();
        c.heartbeat(heartbeat(10));
        c.shutdown();
        c.shutdown();
        assert!(c.is_shut_down());
        let (g, ..) = two_stage_graph();
        assert!(matches!(c.start_job(g), Err(CoordinatorError::ShutDown)));
    }
}
