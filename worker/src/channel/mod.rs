//! Administrador de canales del worker: colas de entrada por canal,
//! canales de salida registrados, cache de ubicaciones y contadores.

mod gate;
mod server;

pub use gate::{InboundEvent, InputGate, OutputGate};
pub(crate) use gate::next_batch as gate_next_batch;
pub use server::serve_data;

use common::{
    BufferUtilization, ChannelId, ChannelLookup, ChannelUtilization, CoordinatorProtocol,
    InstanceConnectionInfo, TaskDeploymentDescriptor, VertexId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskError;

/// Espera entre consultas mientras el consumidor no está desplegado.
pub const LOOKUP_RETRY: Duration = Duration::from_millis(50);
/// Errores RPC seguidos tolerados al resolver un canal.
pub const MAX_LOOKUP_FAILURES: u32 = 20;

struct InputEndpoint {
    consumer: VertexId,
    sender: mpsc::Sender<InboundEvent>,
}

#[derive(Default)]
struct Counters {
    records_sent: AtomicU64,
    records_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

pub struct ChannelManager {
    local: InstanceConnectionInfo,
    coordinator: Arc<dyn CoordinatorProtocol>,
    num_buffers: usize,
    buffer_size: usize,

    inputs: Mutex<HashMap<ChannelId, InputEndpoint>>,
    outputs: Mutex<HashMap<ChannelId, VertexId>>,
    tasks: Mutex<HashSet<VertexId>>,
    cache: Mutex<HashMap<ChannelId, InstanceConnectionInfo>>,
    counters: Counters,
}

impl ChannelManager {
    pub fn new(
        local: InstanceConnectionInfo,
        coordinator: Arc<dyn CoordinatorProtocol>,
        num_buffers: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            local,
            coordinator,
            num_buffers: num_buffers.max(1),
            buffer_size: buffer_size.max(1),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn local(&self) -> &InstanceConnectionInfo {
        &self.local
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Crea una cola acotada por cada canal de entrada de la tarea y
    /// devuelve los extremos de lectura, en el orden de los gates.
    pub fn register(&self, tdd: &TaskDeploymentDescriptor) -> Vec<InputGate> {
        let mut gates = Vec::with_capacity(tdd.inputs.len());
        {
            let mut inputs = self.inputs.lock();
            for g in &tdd.inputs {
                let (tx, rx) = mpsc::channel(self.num_buffers);
                inputs.insert(
                    g.channel_id.clone(),
                    InputEndpoint {
                        consumer: tdd.vertex_id.clone(),
                        sender: tx,
                    },
                );
                gates.push(InputGate::new(g.channel_id.clone(), rx));
            }
        }
        {
            let mut outputs = self.outputs.lock();
            for g in &tdd.outputs {
                outputs.insert(g.channel_id.clone(), tdd.vertex_id.clone());
            }
        }
        self.tasks.lock().insert(tdd.vertex_id.clone());

        debug!(
            "canales registrados para {}: {} entradas, {} salidas",
            tdd.vertex_id,
            tdd.inputs.len(),
            tdd.outputs.len()
        );
        gates
    }

    /// Saca todos los extremos de la tarea, haya terminado como haya terminado.
    pub fn unregister(&self, vertex_id: &VertexId) {
        self.inputs.lock().retain(|_, ep| &ep.consumer != vertex_id);
        self.outputs.lock().retain(|_, producer| producer != vertex_id);
        self.tasks.lock().remove(vertex_id);
    }

    pub fn is_registered(&self, vertex_id: &VertexId) -> bool {
        self.tasks.lock().contains(vertex_id)
    }

    pub fn invalidate_lookup_cache_entries(&self, channels: &HashSet<ChannelId>) {
        let mut cache = self.cache.lock();
        for c in channels {
            cache.remove(c);
        }
    }

    pub fn utilization(&self) -> BufferUtilization {
        let input_channels = self
            .inputs
            .lock()
            .iter()
            .map(|(id, ep)| ChannelUtilization {
                channel_id: id.clone(),
                queued_buffers: ep.sender.max_capacity() - ep.sender.capacity(),
                capacity: ep.sender.max_capacity(),
            })
            .collect();

        BufferUtilization {
            registered_tasks: self.tasks.lock().len(),
            input_channels,
            output_channels: self.outputs.lock().len(),
            cached_lookups: self.cache.lock().len(),
            records_sent: self.counters.records_sent.load(Ordering::Relaxed),
            records_received: self.counters.records_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        self.inputs.lock().clear();
        self.outputs.lock().clear();
        self.tasks.lock().clear();
        self.cache.lock().clear();
    }

    /* ---------------- uso interno de gates y servidor ---------------- */

    pub(crate) fn input_sender(&self, channel: &ChannelId) -> Option<mpsc::Sender<InboundEvent>> {
        self.inputs.lock().get(channel).map(|ep| ep.sender.clone())
    }

    pub(crate) fn count_sent(&self, records: usize, bytes: usize) {
        self.counters
            .records_sent
            .fetch_add(records as u64, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_received(&self, records: usize, bytes: usize) {
        self.counters
            .records_received
            .fetch_add(records as u64, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Dónde vive el consumidor de `channel`. Consulta la cache y si no
    /// está, al coordinador, reintentando mientras siga `Pending`.
    pub(crate) async fn resolve(
        &self,
        channel: &ChannelId,
        cancel: &CancellationToken,
    ) -> Result<InstanceConnectionInfo, TaskError> {
        if let Some(hit) = self.cache.lock().get(channel) {
            return Ok(hit.clone());
        }

        let mut failures = 0u32;
        loop {
            match self.coordinator.lookup_channel(channel).await {
                Ok(ChannelLookup::Found(info)) => {
                    self.cache.lock().insert(channel.clone(), info.clone());
                    return Ok(info);
                }
                Ok(ChannelLookup::Unknown) => {
                    return Err(TaskError::Execution(format!(
                        "el coordinador no conoce el canal {}",
                        channel
                    )));
                }
                Ok(ChannelLookup::Pending) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("lookup de {} falló ({}): {}", channel, failures, e);
                    if failures >= MAX_LOOKUP_FAILURES {
                        return Err(TaskError::Execution(format!(
                            "no se pudo resolver el canal {}: {}",
                            channel, e
                        )));
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep(LOOKUP_RETRY) => {}
            }
        }
    }

    /// Arma los gates de salida de una tarea.
    pub fn output_gates(
        self: &Arc<Self>,
        tdd: &TaskDeploymentDescriptor,
        cancel: &CancellationToken,
        handle: &Handle,
    ) -> Vec<OutputGate> {
        tdd.outputs
            .iter()
            .map(|g| {
                OutputGate::new(
                    g.channel_id.clone(),
                    Arc::clone(self),
                    cancel.clone(),
                    handle.clone(),
                )
            })
            .collect()
    }
}
