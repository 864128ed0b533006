use common::{ExecutionState, JobId, VertexId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::InputGate;
use crate::environment::RuntimeEnvironment;
use crate::memory::AllocationId;

/// Quien se entera de los cambios de estado de una tarea (el worker).
pub trait TaskListener: Send + Sync {
    /// Se llama después de cada transición aceptada, en orden. Un `Err`
    /// hace fallar la tarea con esa descripción.
    fn execution_state_changed(
        &self,
        task: &Task,
        state: ExecutionState,
        description: Option<String>,
    ) -> Result<(), String>;

    /// Acumuladores finales; se llama antes de pasar a `FINISHED`.
    fn report_accumulators(&self, task: &Task, values: BTreeMap<String, i64>);
}

pub struct Task {
    vertex_id: VertexId,
    job_id: JobId,
    task_name: String,
    allocation: AllocationId,
    profiling: bool,

    state: Mutex<ExecutionState>,
    environment: Mutex<Option<RuntimeEnvironment>>,
    cancel: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    listener: Weak<dyn TaskListener>,
}

impl Task {
    /// La tarea nace `ASSIGNED`: el coordinador ya la asignó a este worker.
    pub fn new(environment: RuntimeEnvironment, listener: Weak<dyn TaskListener>) -> Self {
        let tdd = environment.descriptor();
        Self {
            vertex_id: tdd.vertex_id.clone(),
            job_id: tdd.job_id.clone(),
            task_name: tdd.task_name.clone(),
            profiling: tdd.profiling_requested(),
            allocation: environment.allocation(),
            cancel: environment.cancel_token(),
            state: Mutex::new(ExecutionState::Assigned),
            environment: Mutex::new(Some(environment)),
            thread: Mutex::new(None),
            listener,
        }
    }

    pub fn vertex_id(&self) -> &VertexId {
        &self.vertex_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn allocation(&self) -> AllocationId {
        self.allocation
    }

    /// `profile` de la config del job.
    pub fn profiling_requested(&self) -> bool {
        self.profiling
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock()
    }

    pub(crate) fn bind_inputs(&self, gates: Vec<InputGate>) {
        if let Some(env) = self.environment.lock().as_mut() {
            env.bind_inputs(gates);
        }
    }

    /// Arranca el hilo de la tarea.
    pub fn start_execution(self: &Arc<Self>, handle: &Handle) {
        let task = Arc::clone(self);
        let join = handle.spawn_blocking(move || task.run());
        *self.thread.lock() = Some(join);
    }

    fn run(&self) {
        let Some(mut env) = self.environment.lock().take() else {
            // cancelada antes de arrancar
            return;
        };

        if self.cancel.is_cancelled() {
            drop(env);
            self.transition(ExecutionState::Canceled, None);
            return;
        }

        if !self.transition(ExecutionState::Running, None)
            || self.state() != ExecutionState::Running
        {
            return;
        }

        info!("tarea {} ({}) corriendo", self.task_name, self.vertex_id);

        match env.run() {
            Ok(()) => {
                let values = env.accumulators().snapshot();
                drop(env);
                if let Some(listener) = self.listener.upgrade() {
                    listener.report_accumulators(self, values);
                }
                self.transition(ExecutionState::Finished, None);
            }
            Err(e) => {
                if self.cancel.is_cancelled() {
                    self.transition(ExecutionState::Canceled, None);
                } else {
                    self.transition(ExecutionState::Failed, Some(format!("{:#}", e)));
                }
                // los consumidores ven el canal roto recién después del aviso
                drop(env);
            }
        }
    }

    /// Cancela la tarea. Si no arrancó pasa directo a `CANCELED`; si está
    /// corriendo pasa a `CANCELING` y el hilo termina de cancelarla.
    pub fn cancel_execution(&self) {
        let state = self.state();
        if state.is_terminal() || state == ExecutionState::Canceling {
            return;
        }

        self.cancel.cancel();

        let not_started = self.environment.lock().take();
        if let Some(env) = not_started {
            drop(env);
            self.transition(ExecutionState::Canceled, None);
        } else {
            self.transition(ExecutionState::Canceling, None);
        }
    }

    /// El hilo terminó sin llegar a un estado final (panic).
    pub fn is_terminated(&self) -> bool {
        let finished = self
            .thread
            .lock()
            .as_ref()
            .map(|j| j.is_finished())
            .unwrap_or(false);
        finished && !self.state().is_terminal()
    }

    pub fn mark_failed(&self, description: impl Into<String>) {
        self.cancel.cancel();
        self.environment.lock().take();
        self.transition(ExecutionState::Failed, Some(description.into()));
    }

    /// Aplica la transición si es válida y avisa al listener. Devuelve si
    /// se aplicó.
    pub fn transition(&self, next: ExecutionState, description: Option<String>) -> bool {
        {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                debug!(
                    "transición ignorada para {}: {} -> {}",
                    self.vertex_id, *state, next
                );
                return false;
            }
            *state = next;
        }

        let Some(listener) = self.listener.upgrade() else {
            return true;
        };

        if let Err(fault) = listener.execution_state_changed(self, next, description) {
            warn!("falla inyectada en {} al pasar a {}: {}", self.vertex_id, next, fault);
            if !next.is_terminal() {
                self.cancel.cancel();
                self.transition(ExecutionState::Failed, Some(fault));
            }
        }
        true
    }
}
