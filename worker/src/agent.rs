use async_trait::async_trait;
use common::{
    AccumulatorReport, BufferUtilization, ChannelId, CoordinatorProtocol, ExecutionState,
    HardwareDescription, Heartbeat, HttpCoordinatorClient, InstanceConnectionInfo, ReturnCode,
    RpcError, TaskCancelResult, TaskDeploymentDescriptor, TaskExecutionState,
    TaskSubmissionResult, VertexId, WorkerProtocol,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{serve_data, ChannelManager};
use crate::config::WorkerConfig;
use crate::environment::{EnvironmentDeps, RuntimeEnvironment};
use crate::error::{TaskError, WorkerError};
use crate::fault::{FaultPolicy, NoFaults};
use crate::handlers;
use crate::hardware;
use crate::invokable::InvokableRegistry;
use crate::io::{check_tmp_dirs, IoManager};
use crate::memory::MemoryManager;
use crate::net::AddressDetector;
use crate::profiler::TaskProfiler;
use crate::task::{Task, TaskListener};

/// Demora entre responder el kill y terminar el proceso.
pub const KILL_DELAY: Duration = Duration::from_millis(10);
/// Cuánto espera el apagado a que las tareas canceladas terminen.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const NOTIFY_ATTEMPTS: u32 = 3;
const NOTIFY_RETRY: Duration = Duration::from_millis(100);

/// Qué hacer cuando el coordinador pide matar el proceso.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

enum Notification {
    State(TaskExecutionState),
    Accumulators(AccumulatorReport),
}

/* ---------------- builder ---------------- */

pub struct WorkerBuilder {
    config: WorkerConfig,
    coordinator: Option<Arc<dyn CoordinatorProtocol>>,
    registry: Option<Arc<InvokableRegistry>>,
    fault: Arc<dyn FaultPolicy>,
    terminator: Terminator,
}

impl WorkerBuilder {
    /// Cliente del coordinador; por defecto HTTP contra `coordinator_addr`.
    pub fn coordinator(mut self, coordinator: Arc<dyn CoordinatorProtocol>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn registry(mut self, registry: Arc<InvokableRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fault_policy(mut self, fault: Arc<dyn FaultPolicy>) -> Self {
        self.fault = fault;
        self
    }

    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Arranca el worker: valida directorios, detecta la dirección propia,
    /// abre los puertos, arma los administradores y lanza el servidor RPC,
    /// el de datos y el loop de heartbeats.
    pub async fn start(self) -> Result<WorkerAgent, WorkerError> {
        let config = self.config;

        // 1) directorios temporales
        check_tmp_dirs(&config.tmp_dirs)?;

        // 2) dirección propia
        let detected = AddressDetector::system()
            .detect(config.coordinator_addr)
            .await?;
        info!(
            "dirección propia {} (estrategia {:?})",
            detected.address, detected.strategy
        );

        // 3) puertos
        let rpc_listener = bind(SocketAddr::new(detected.address, config.rpc_port)).await?;
        let data_listener = bind(SocketAddr::new(detected.address, config.data_port)).await?;
        let instance = InstanceConnectionInfo {
            address: detected.address,
            rpc_port: rpc_listener.local_addr()?.port(),
            data_port: data_listener.local_addr()?.port(),
        };

        // 4) hardware y administradores
        let hardware = hardware::apply_memory_override(
            hardware::probe(config.workers_per_process),
            config.memory_size_mb,
        )?;
        let memory = Arc::new(MemoryManager::new(hardware.usable_memory, config.page_size)?);
        let io = Arc::new(IoManager::new(config.tmp_dirs.clone())?);

        let coordinator = self.coordinator.unwrap_or_else(|| {
            Arc::new(HttpCoordinatorClient::new(config.coordinator_url()))
                as Arc<dyn CoordinatorProtocol>
        });
        let channels = Arc::new(ChannelManager::new(
            instance.clone(),
            Arc::clone(&coordinator),
            config.num_buffers,
            config.buffer_size,
        ));

        let handle = Handle::current();
        let deps = EnvironmentDeps {
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(InvokableRegistry::with_builtins())),
            memory,
            io,
            channels,
            coordinator,
            handle: handle.clone(),
        };

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(AgentInner {
            config,
            instance,
            hostname,
            hardware,
            deps,
            profiler: TaskProfiler::new(),
            tasks: Mutex::new(HashMap::new()),
            fault: self.fault,
            notifier: notify_tx,
            terminator: self.terminator,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            is_shut_down: AtomicBool::new(false),
        });
        let agent = WorkerAgent { inner };

        // 5) tareas de fondo
        handle.spawn(dispatch_notifications(
            Arc::clone(&agent.inner.deps.coordinator),
            notify_rx,
        ));
        handle.spawn(serve_data(
            data_listener,
            Arc::clone(&agent.inner.deps.channels),
            agent.inner.shutdown.clone(),
        ));

        let app = handlers::build_router(agent.clone());
        let stop = agent.inner.shutdown.clone();
        handle.spawn(async move {
            let server = axum::serve(rpc_listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await });
            if let Err(e) = server.await {
                warn!("servidor RPC del worker terminó con error: {}", e);
            }
        });

        handle.spawn(heartbeat_loop(Arc::clone(&agent.inner)));

        info!(
            "worker {} listo: {} cores, {} MiB usables, {} páginas de {} bytes",
            agent.inner.instance,
            agent.inner.hardware.cpu_cores,
            agent.inner.hardware.usable_memory >> 20,
            agent.inner.deps.memory.total_pages(),
            agent.inner.deps.memory.page_size()
        );
        Ok(agent)
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, WorkerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| WorkerError::Bind { addr, source })
}

/* ---------------- agente ---------------- */

/// Worker: recibe tareas del coordinador, las corre y le informa cada
/// cambio de estado.
#[derive(Clone)]
pub struct WorkerAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: WorkerConfig,
    instance: InstanceConnectionInfo,
    hostname: String,
    hardware: HardwareDescription,
    deps: EnvironmentDeps,
    profiler: TaskProfiler,

    tasks: Mutex<HashMap<VertexId, Arc<Task>>>,
    fault: Arc<dyn FaultPolicy>,
    notifier: mpsc::UnboundedSender<Notification>,
    terminator: Terminator,

    /// Corta servidores y loops de fondo.
    shutdown: CancellationToken,
    /// Se cancela cuando el apagado terminó.
    stopped: CancellationToken,
    stopping: AtomicBool,
    is_shut_down: AtomicBool,
}

impl WorkerAgent {
    pub fn builder(config: WorkerConfig) -> WorkerBuilder {
        WorkerBuilder {
            config,
            coordinator: None,
            registry: None,
            fault: Arc::new(NoFaults),
            terminator: Arc::new(|| std::process::exit(0)),
        }
    }

    pub async fn start(config: WorkerConfig) -> Result<Self, WorkerError> {
        Self::builder(config).start().await
    }

    pub fn instance(&self) -> &InstanceConnectionInfo {
        &self.inner.instance
    }

    pub fn hardware(&self) -> HardwareDescription {
        self.inner.hardware
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.inner.deps.memory
    }

    pub fn io_manager(&self) -> &Arc<IoManager> {
        &self.inner.deps.io
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.inner.deps.channels
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn task_state(&self, vertex_id: &VertexId) -> Option<ExecutionState> {
        self.inner.tasks.lock().get(vertex_id).map(|t| t.state())
    }

    /// `true` recién cuando servidores y administradores están apagados.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down.load(Ordering::SeqCst)
    }

    /// Se completa cuando el worker se apagó.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Pide el apagado y espera a que termine. El apagado corre en su propia
    /// tarea: si quien espera se rinde, igual llega hasta el final. Llamarlo
    /// de nuevo sólo espera.
    pub async fn shutdown(&self) {
        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            self.inner.deps.handle.spawn(inner.shut_down());
        }
        self.stopped().await
    }

    /// Chequeo de liveness: tareas cuyo hilo terminó sin estado final.
    pub fn check_task_execution(&self) {
        self.inner.check_task_execution();
    }
}

impl AgentInner {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Cancela las tareas, corta servidores y loops, espera hasta
    /// `SHUTDOWN_GRACE` a que las tareas terminen y apaga los
    /// administradores.
    async fn shut_down(self: Arc<Self>) {
        info!("apagando worker {}", self.instance);

        let tasks: Vec<Arc<Task>> = self.tasks.lock().values().cloned().collect();
        for t in tasks {
            t.cancel_execution();
        }
        self.shutdown.cancel();

        // sin loop de heartbeat, el chequeo de liveness se hace acá
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.tasks.lock().is_empty() && Instant::now() < deadline {
            self.check_task_execution();
            sleep(Duration::from_millis(20)).await;
        }
        let left = self.tasks.lock().len();
        if left > 0 {
            warn!("{} tareas seguían registradas al apagar", left);
        }

        self.deps.channels.shutdown();
        self.profiler.shutdown();
        self.deps.io.shutdown();
        self.deps.memory.shutdown();

        self.is_shut_down.store(true, Ordering::SeqCst);
        self.stopped.cancel();
        info!("worker {} apagado", self.instance);
    }

    fn listener(self: &Arc<Self>) -> std::sync::Weak<dyn TaskListener> {
        let listener: Arc<dyn TaskListener> = self.clone();
        Arc::downgrade(&listener)
    }

    /// Registra el lote entero y recién después arranca las tareas, así
    /// los productores encuentran registrados a sus consumidores locales.
    fn submit_tasks(self: &Arc<Self>, tasks: Vec<TaskDeploymentDescriptor>) -> Vec<TaskSubmissionResult> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut created = Vec::with_capacity(tasks.len());

        for tdd in tasks {
            let vertex_id = tdd.vertex_id.clone();
            match self.create_and_register_task(tdd) {
                Ok(task) => {
                    results.push(TaskSubmissionResult::success(vertex_id));
                    created.push(task);
                }
                Err(e) => {
                    warn!("no se pudo desplegar {}: {}", vertex_id, e);
                    results.push(TaskSubmissionResult::error(
                        vertex_id,
                        e.return_code(),
                        e.to_string(),
                    ));
                }
            }
        }

        for task in created {
            task.start_execution(&self.deps.handle);
        }
        results
    }

    fn create_and_register_task(
        self: &Arc<Self>,
        tdd: TaskDeploymentDescriptor,
    ) -> Result<Arc<Task>, TaskError> {
        if self.is_stopping() {
            return Err(TaskError::Deployment("el worker se está apagando".into()));
        }

        let vertex_id = tdd.vertex_id.clone();
        if self.tasks.lock().contains_key(&vertex_id) {
            return Err(TaskError::DuplicateTask(vertex_id.to_string()));
        }

        let env = RuntimeEnvironment::build(tdd.clone(), &self.deps)?;
        let task = Arc::new(Task::new(env, self.listener()));

        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&vertex_id) {
                drop(tasks);
                // otro submit ganó: se liberan sólo los recursos propios
                let allocation = task.allocation();
                drop(task);
                self.deps.memory.release(allocation);
                self.deps.io.release(allocation);
                return Err(TaskError::DuplicateTask(vertex_id.to_string()));
            }
            task.bind_inputs(self.deps.channels.register(&tdd));
            if self.config.profiling && task.profiling_requested() {
                self.profiler.register(&vertex_id, task.task_name());
            }
            tasks.insert(vertex_id.clone(), Arc::clone(&task));
        }

        debug!("tarea {} ({}) registrada", task.task_name(), vertex_id);
        Ok(task)
    }

    /// Libera todo lo de la tarea. Sólo la primera llamada hace algo.
    fn unregister_task(&self, vertex_id: &VertexId) {
        let Some(task) = self.tasks.lock().remove(vertex_id) else {
            return;
        };

        self.deps.channels.unregister(vertex_id);
        self.profiler.unregister(vertex_id);
        let pages = self.deps.memory.release(task.allocation());
        let files = self.deps.io.release(task.allocation());

        debug!(
            "tarea {} desregistrada: {} páginas y {} archivos liberados",
            vertex_id, pages, files
        );
    }

    fn cancel_task(&self, vertex_id: &VertexId) -> TaskCancelResult {
        let task = self.tasks.lock().get(vertex_id).cloned();
        let description = match task {
            None => Some("la tarea no está en este worker".to_string()),
            Some(task) => {
                info!("cancelando tarea {}", vertex_id);
                self.deps
                    .handle
                    .spawn_blocking(move || task.cancel_execution());
                None
            }
        };

        TaskCancelResult {
            vertex_id: vertex_id.clone(),
            code: ReturnCode::Success,
            description,
        }
    }

    fn kill(&self) {
        warn!("el coordinador pidió terminar el proceso del worker {}", self.instance);
        let terminator = Arc::clone(&self.terminator);
        self.deps.handle.spawn(async move {
            sleep(KILL_DELAY).await;
            terminator();
        });
    }

    fn check_task_execution(&self) {
        let tasks: Vec<Arc<Task>> = self.tasks.lock().values().cloned().collect();
        for task in tasks {
            if task.is_terminated() {
                warn!(
                    "el hilo de la tarea {} terminó en estado {}",
                    task.vertex_id(),
                    task.state()
                );
                task.mark_failed(TaskError::UnexpectedTermination.to_string());
            }
        }
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            instance: self.instance.clone(),
            hostname: self.hostname.clone(),
            hardware: self.hardware,
            running_tasks: self.tasks.lock().len() as u32,
            free_memory_pages: self.deps.memory.free_pages(),
        }
    }
}

impl TaskListener for AgentInner {
    fn execution_state_changed(
        &self,
        task: &Task,
        state: ExecutionState,
        description: Option<String>,
    ) -> Result<(), String> {
        // CANCELING no se informa; el coordinador espera el estado final
        if state != ExecutionState::Canceling {
            if state.is_terminal() {
                self.unregister_task(task.vertex_id());
            }

            debug!("tarea {} -> {}", task.vertex_id(), state);
            let _ = self.notifier.send(Notification::State(TaskExecutionState {
                job_id: task.job_id().clone(),
                vertex_id: task.vertex_id().clone(),
                state,
                description,
            }));
        }

        self.fault.on_state_change(task.vertex_id(), state)
    }

    fn report_accumulators(&self, task: &Task, values: BTreeMap<String, i64>) {
        if values.is_empty() {
            return;
        }
        let _ = self.notifier.send(Notification::Accumulators(AccumulatorReport {
            job_id: task.job_id().clone(),
            vertex_id: task.vertex_id().clone(),
            values,
        }));
    }
}

/* ---------------- loops de fondo ---------------- */

/// Manda las notificaciones al coordinador en el orden en que se generaron.
async fn dispatch_notifications(
    coordinator: Arc<dyn CoordinatorProtocol>,
    mut rx: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(n) = rx.recv().await {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match &n {
                Notification::State(s) => coordinator.update_task_execution_state(s.clone()).await,
                Notification::Accumulators(a) => coordinator.report_accumulators(a.clone()).await,
            };
            match result {
                Ok(()) => break,
                Err(e) if attempt < NOTIFY_ATTEMPTS => {
                    debug!("notificación al coordinador falló (intento {}): {}", attempt, e);
                    sleep(NOTIFY_RETRY).await;
                }
                Err(e) => {
                    warn!("no se pudo notificar al coordinador: {}", e);
                    break;
                }
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<AgentInner>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        inner.check_task_execution();

        if inner.fault.suppress_heartbeat() {
            continue;
        }
        if let Err(e) = inner.deps.coordinator.send_heartbeat(inner.heartbeat()).await {
            warn!("heartbeat de {} falló: {}", inner.instance, e);
        }
    }
    debug!("loop de heartbeat de {} terminado", inner.instance);
}

/* ---------------- protocolo en proceso ---------------- */

#[async_trait]
impl WorkerProtocol for WorkerAgent {
    async fn submit_tasks(
        &self,
        tasks: Vec<TaskDeploymentDescriptor>,
    ) -> Result<Vec<TaskSubmissionResult>, RpcError> {
        Ok(self.inner.submit_tasks(tasks))
    }

    async fn cancel_task(&self, vertex_id: &VertexId) -> Result<TaskCancelResult, RpcError> {
        Ok(self.inner.cancel_task(vertex_id))
    }

    async fn invalidate_lookup_cache_entries(
        &self,
        channels: HashSet<ChannelId>,
    ) -> Result<(), RpcError> {
        self.inner.deps.channels.invalidate_lookup_cache_entries(&channels);
        Ok(())
    }

    async fn kill_agent_process(&self) -> Result<(), RpcError> {
        self.inner.kill();
        Ok(())
    }

    async fn report_buffer_utilization(&self) -> Result<BufferUtilization, RpcError> {
        Ok(self.inner.deps.channels.utilization())
    }
}
