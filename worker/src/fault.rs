//! Inyección de fallas. Se pasa al construir el worker; en producción
//! es `NoFaults`.

use common::{ExecutionState, VertexId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub trait FaultPolicy: Send + Sync {
    /// Se llama en cada cambio de estado de una tarea. Un `Err` hace
    /// fallar la tarea con esa descripción.
    fn on_state_change(&self, _vertex: &VertexId, _state: ExecutionState) -> Result<(), String> {
        Ok(())
    }

    /// `true` para no mandar el heartbeat de este tick.
    fn suppress_heartbeat(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {}

/// Hace fallar las tareas que entran a `state`, hasta `max_failures` veces.
#[derive(Debug)]
pub struct FailOnState {
    worker_index: usize,
    state: ExecutionState,
    max_failures: usize,
    failures: AtomicUsize,
}

impl FailOnState {
    pub fn new(worker_index: usize, state: ExecutionState, max_failures: usize) -> Self {
        Self {
            worker_index,
            state,
            max_failures,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl FaultPolicy for FailOnState {
    fn on_state_change(&self, _vertex: &VertexId, state: ExecutionState) -> Result<(), String> {
        if state != self.state {
            return Ok(());
        }
        let prev = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_failures).then_some(n + 1)
            });
        match prev {
            Ok(_) => Err(format!("Worker #{} failed.", self.worker_index)),
            Err(_) => Ok(()),
        }
    }
}

/// Worker que nunca manda heartbeats: para probar timeouts de arranque.
#[derive(Debug, Default)]
pub struct SilentHeartbeat {
    silent: AtomicBool,
}

impl SilentHeartbeat {
    pub fn new() -> Self {
        Self {
            silent: AtomicBool::new(true),
        }
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }
}

impl FaultPolicy for SilentHeartbeat {
    fn suppress_heartbeat(&self) -> bool {
        self.silent.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_on_state_stops_after_max_failures() {
        let p = FailOnState::new(2, ExecutionState::Running, 2);
        let v = VertexId::new();

        assert!(p.on_state_change(&v, ExecutionState::Assigned).is_ok());
        assert_eq!(
            p.on_state_change(&v, ExecutionState::Running),
            Err("Worker #2 failed.".to_string())
        );
        assert!(p.on_state_change(&v, ExecutionState::Running).is_err());
        assert!(p.on_state_change(&v, ExecutionState::Running).is_ok());
        assert_eq!(p.failures(), 2);
    }

    #[test]
    fn silent_heartbeat_can_be_switched_off() {
        let p = SilentHeartbeat::new();
        assert!(p.suppress_heartbeat());
        p.set_silent(false);
        assert!(!p.suppress_heartbeat());
        assert!(!NoFaults.suppress_heartbeat());
    }
}
