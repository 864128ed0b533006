use chrono::{DateTime, Utc};
use common::{
    ChannelId, ExecutionState, HardwareDescription, Heartbeat, InputSplit, InstanceConnectionInfo,
    JobId, JobInfo, JobResult, JobStatus, VertexId, WorkerMetrics,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/* ---------------- workers ---------------- */

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub instance: InstanceConnectionInfo,
    pub hostname: String,
    pub hardware: HardwareDescription,
    pub last_heartbeat: Instant,
    pub dead: bool,

    // Métricas
    pub running_tasks: u32,
    pub free_memory_pages: usize,
    pub tasks_deployed: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
}

impl WorkerEntry {
    pub fn new(hb: &Heartbeat) -> Self {
        Self {
            instance: hb.instance.clone(),
            hostname: hb.hostname.clone(),
            hardware: hb.hardware,
            last_heartbeat: Instant::now(),
            dead: false,
            running_tasks: hb.running_tasks,
            free_memory_pages: hb.free_memory_pages,
            tasks_deployed: 0,
            tasks_finished: 0,
            tasks_failed: 0,
        }
    }

    pub fn touch(&mut self, hb: &Heartbeat) {
        self.hostname = hb.hostname.clone();
        self.hardware = hb.hardware;
        self.running_tasks = hb.running_tasks;
        self.free_memory_pages = hb.free_memory_pages;
        self.last_heartbeat = Instant::now();
    }

    pub fn metrics(&self, now: Instant) -> WorkerMetrics {
        WorkerMetrics {
            instance: self.instance.clone(),
            hostname: self.hostname.clone(),
            dead: self.dead,
            last_heartbeat_secs_ago: now.saturating_duration_since(self.last_heartbeat).as_secs(),
            hardware: self.hardware,
            running_tasks: self.running_tasks,
            free_memory_pages: self.free_memory_pages,
            tasks_deployed: self.tasks_deployed,
            tasks_finished: self.tasks_finished,
            tasks_failed: self.tasks_failed,
        }
    }
}

/* ---------------- jobs ---------------- */

#[derive(Debug)]
pub struct VertexRecord {
    pub name: String,
    pub state: ExecutionState,
    pub worker: Option<InstanceConnectionInfo>,
    /// El worker aceptó el despliegue (o ya reportó un estado).
    pub deployed: bool,
    pub cancel_requested: bool,
    pub splits: VecDeque<InputSplit>,
}

#[derive(Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub vertices: HashMap<VertexId, VertexRecord>,
    /// canal -> vértice consumidor
    pub channels: HashMap<ChannelId, VertexId>,
    pub accumulators: BTreeMap<String, i64>,
    pub failure: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub started: Instant,
    pub elapsed: Option<Duration>,

    pub done: watch::Sender<JobStatus>,
}

impl JobRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Created | JobStatus::Running)
    }

    pub fn all_terminal(&self) -> bool {
        self.vertices.values().all(|v| v.state.is_terminal())
    }

    fn count(&self, f: impl Fn(ExecutionState) -> bool) -> u32 {
        self.vertices.values().filter(|v| f(v.state)).count() as u32
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            failure: self.failure.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
            total_tasks: self.vertices.len() as u32,
            running_tasks: self.count(|s| {
                matches!(s, ExecutionState::Running | ExecutionState::Canceling)
            }),
            finished_tasks: self.count(|s| s == ExecutionState::Finished),
            failed_tasks: self.count(|s| s == ExecutionState::Failed),
            canceled_tasks: self.count(|s| s == ExecutionState::Canceled),
        }
    }

    pub fn result(&self) -> JobResult {
        let elapsed = self.elapsed.unwrap_or_else(|| self.started.elapsed());
        JobResult {
            job_id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            accumulators: self.accumulators.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}
