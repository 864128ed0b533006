use serde::{Deserialize, Serialize};
use std::fmt;

/// Estado de ejecución de una tarea.
///
/// Los estados sólo avanzan; una tarea en ejecución puede pasar a
/// `Canceling` cuando llega un pedido de cancelación:
///
/// ```text
/// CREATED -> SCHEDULED -> ASSIGNED -> RUNNING -> FINISHED | CANCELED | FAILED
///                                        \-> CANCELING -> CANCELED | FAILED | FINISHED
/// ```
///
/// Cualquier estado no terminal puede fallar o cancelarse directamente.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Scheduled,
    Assigned,
    Running,
    Canceling,
    Finished,
    Canceled,
    Failed,
}

impl ExecutionState {
    /// `FINISHED`, `CANCELED` y `FAILED` no admiten más transiciones.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Finished | ExecutionState::Canceled | ExecutionState::Failed
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) | (_, Canceled) => true,
            (Created, Scheduled) => true,
            (Scheduled, Assigned) => true,
            (Assigned, Running) => true,
            (Running, Canceling) => true,
            (Running, Finished) => true,
            // la tarea puede terminar antes de ver la cancelación
            (Canceling, Finished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Scheduled => "SCHEDULED",
            ExecutionState::Assigned => "ASSIGNED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Canceling => "CANCELING",
            ExecutionState::Finished => "FINISHED",
            ExecutionState::Canceled => "CANCELED",
            ExecutionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Estado agregado de un job sobre todas sus tareas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    /// Falló una tarea; se están cancelando las demás.
    Failing,
    /// Se pidió cancelar el job.
    Canceling,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionState::*;
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(Created.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
    }

    #[test]
    fn terminal_states_are_final() {
        for s in [Finished, Canceled, Failed] {
            assert!(s.is_terminal());
            for next in [Created, Running, Canceling, Finished, Canceled, Failed] {
                assert!(!s.can_transition_to(next), "{s} -> {next}");
            }
        }
    }

    #[test]
    fn canceling_is_only_entered_from_running() {
        assert!(Running.can_transition_to(Canceling));
        assert!(!Assigned.can_transition_to(Canceling));
        assert!(!Created.can_transition_to(Canceling));
        assert!(Canceling.can_transition_to(Canceled));
    }

    #[test]
    fn states_cannot_move_backwards() {
        assert!(!Running.can_transition_to(Assigned));
        assert!(!Assigned.can_transition_to(Scheduled));
        assert!(!Canceling.can_transition_to(Running));
    }

    #[test]
    fn wire_names_are_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&Canceling).unwrap(), "\"CANCELING\"");
        assert_eq!(
            serde_json::to_string(&JobStatus::Failing).unwrap(),
            "\"FAILING\""
        );
    }
}
