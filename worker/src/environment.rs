use common::{
    CoordinatorProtocol, InputSplit, JobId, Record, TaskDeploymentDescriptor, VertexId,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{self, ChannelManager, InputGate, OutputGate};
use crate::error::TaskError;
use crate::invokable::{Invokable, InvokableRegistry};
use crate::io::IoManager;
use crate::memory::{AllocationId, MemoryManager, MemorySegment};

/// Pide splits al coordinador en nombre de una tarea.
pub struct InputSplitProvider {
    job_id: JobId,
    vertex_id: VertexId,
    coordinator: Arc<dyn CoordinatorProtocol>,
    handle: Handle,
    cancel: CancellationToken,
}

impl InputSplitProvider {
    pub fn next(&self) -> Result<Option<InputSplit>, TaskError> {
        self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
                r = self.coordinator.get_next_input_split(&self.job_id, &self.vertex_id) => {
                    r.map_err(|e| TaskError::Execution(format!("no se pudo pedir el siguiente split: {}", e)))
                }
            }
        })
    }
}

/// Contadores con nombre que la tarea acumula y reporta al terminar.
#[derive(Debug, Default, Clone)]
pub struct Accumulators {
    values: BTreeMap<String, i64>,
}

impl Accumulators {
    pub fn add(&mut self, name: &str, delta: i64) {
        *self.values.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values.clone()
    }
}

/// Lo que ve un invokable mientras corre.
pub struct TaskContext {
    descriptor: TaskDeploymentDescriptor,
    allocation: AllocationId,
    memory: Vec<MemorySegment>,
    inputs: Vec<InputGate>,
    input_cursor: usize,
    outputs: Vec<OutputGate>,
    splits: InputSplitProvider,
    accumulators: Accumulators,
    io: Arc<IoManager>,
    cancel: CancellationToken,
    handle: Handle,
}

impl TaskContext {
    pub fn vertex_id(&self) -> &VertexId {
        &self.descriptor.vertex_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.descriptor.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.descriptor.task_name
    }

    pub fn job_config(&self) -> &Value {
        &self.descriptor.job_config
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Siguiente batch de cualquiera de las entradas; `None` cuando todas
    /// terminaron.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Record>>, TaskError> {
        channel::gate_next_batch(
            &mut self.inputs,
            &mut self.input_cursor,
            &self.cancel,
            &self.handle,
        )
    }

    /// Manda el registro a todas las salidas.
    pub fn emit(&mut self, record: Record) -> Result<(), TaskError> {
        let n = self.outputs.len();
        if n == 0 {
            return Ok(());
        }
        for out in &mut self.outputs[..n - 1] {
            out.emit(record.clone())?;
        }
        self.outputs[n - 1].emit(record)
    }

    pub fn emit_to(&mut self, gate: usize, record: Record) -> Result<(), TaskError> {
        let n = self.outputs.len();
        self.outputs
            .get_mut(gate)
            .ok_or_else(|| TaskError::Execution(format!("gate de salida {} de {}", gate, n)))?
            .emit(record)
    }

    pub fn next_split(&self) -> Result<Option<InputSplit>, TaskError> {
        self.splits.next()
    }

    pub fn accumulators(&mut self) -> &mut Accumulators {
        &mut self.accumulators
    }

    /// Archivo temporal que se borra cuando la tarea libera sus recursos.
    pub fn scratch_file(&self, prefix: &str) -> std::io::Result<PathBuf> {
        self.io.create_scratch_file(self.allocation, prefix)
    }

    pub fn memory(&mut self) -> &mut [MemorySegment] {
        &mut self.memory
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn close_outputs(&mut self) -> Result<(), TaskError> {
        for out in &mut self.outputs {
            out.close()?;
        }
        Ok(())
    }
}

/// Dependencias del worker que hacen falta para armar un entorno.
#[derive(Clone)]
pub struct EnvironmentDeps {
    pub registry: Arc<InvokableRegistry>,
    pub memory: Arc<MemoryManager>,
    pub io: Arc<IoManager>,
    pub channels: Arc<ChannelManager>,
    pub coordinator: Arc<dyn CoordinatorProtocol>,
    pub handle: Handle,
}

/// Recursos atados a una tarea: invokable resuelto, páginas de memoria,
/// espacio temporal, splits, acumuladores y gates.
pub struct RuntimeEnvironment {
    invokable: Box<dyn Invokable>,
    context: TaskContext,
}

impl RuntimeEnvironment {
    /// Resuelve el invokable y reserva la memoria pedida. Si algo falla
    /// no queda nada reservado.
    pub fn build(
        tdd: TaskDeploymentDescriptor,
        deps: &EnvironmentDeps,
    ) -> Result<Self, TaskError> {
        // 1) invokable
        let invokable = deps.registry.create(&tdd.invokable, &tdd.task_config)?;

        // 2) memoria
        let allocation = AllocationId::new();
        let memory = deps.memory.allocate(allocation, tdd.memory_pages)?;

        // 3) gates de salida; las entradas se atan al registrar la tarea
        let cancel = CancellationToken::new();
        let outputs = deps.channels.output_gates(&tdd, &cancel, &deps.handle);

        let splits = InputSplitProvider {
            job_id: tdd.job_id.clone(),
            vertex_id: tdd.vertex_id.clone(),
            coordinator: Arc::clone(&deps.coordinator),
            handle: deps.handle.clone(),
            cancel: cancel.clone(),
        };

        debug!(
            "entorno de {} ({}) listo: {} páginas, {} salidas",
            tdd.task_name,
            tdd.vertex_id,
            memory.len(),
            outputs.len()
        );

        Ok(Self {
            invokable,
            context: TaskContext {
                descriptor: tdd,
                allocation,
                memory,
                inputs: Vec::new(),
                input_cursor: 0,
                outputs,
                splits,
                accumulators: Accumulators::default(),
                io: Arc::clone(&deps.io),
                cancel,
                handle: deps.handle.clone(),
            },
        })
    }

    pub fn descriptor(&self) -> &TaskDeploymentDescriptor {
        &self.context.descriptor
    }

    pub fn allocation(&self) -> AllocationId {
        self.context.allocation
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    pub(crate) fn bind_inputs(&mut self, gates: Vec<InputGate>) {
        self.context.inputs = gates;
    }

    /// Corre el invokable y, si terminó bien, cierra las salidas.
    pub(crate) fn run(&mut self) -> anyhow::Result<()> {
        self.invokable.invoke(&mut self.context)?;
        self.context.close_outputs()?;
        Ok(())
    }

    pub(crate) fn accumulators(&self) -> &Accumulators {
        &self.context.accumulators
    }
}
