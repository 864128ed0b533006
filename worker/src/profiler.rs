use chrono::{DateTime, Utc};
use common::VertexId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

struct Entry {
    task_name: String,
    registered_at: DateTime<Utc>,
    started: Instant,
}

/// Profiler por worker: mide el tiempo de vida de cada tarea registrada.
#[derive(Default)]
pub struct TaskProfiler {
    entries: Mutex<HashMap<VertexId, Entry>>,
}

impl TaskProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vertex_id: &VertexId, task_name: &str) {
        self.entries.lock().insert(
            vertex_id.clone(),
            Entry {
                task_name: task_name.to_string(),
                registered_at: Utc::now(),
                started: Instant::now(),
            },
        );
    }

    /// Saca la tarea y devuelve cuánto estuvo registrada.
    pub fn unregister(&self, vertex_id: &VertexId) -> Option<Duration> {
        let entry = self.entries.lock().remove(vertex_id)?;
        let elapsed = entry.started.elapsed();
        info!(
            "profiling {} ({}): registrada a las {}, {} ms",
            entry.task_name,
            vertex_id,
            entry.registered_at.format("%H:%M:%S%.3f"),
            elapsed.as_millis()
        );
        Some(elapsed)
    }

    pub fn is_registered(&self, vertex_id: &VertexId) -> bool {
        self.entries.lock().contains_key(vertex_id)
    }

    pub fn shutdown(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregister_is_one_shot() {
        let p = TaskProfiler::new();
        let v = VertexId::new();
        p.register(&v, "map");
        assert!(p.is_registered(&v));
        assert!(p.unregister(&v).is_some());
        assert!(p.unregister(&v).is_none());
    }
}
