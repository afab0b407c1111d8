use crate::errors::{OrchestratorError, Result};
use crate::types::TaskStatus;

/// The per-task status state machine:
///
/// ```text
/// Pending -> Assigned -> InProgress -> {Done | Failed}
///    ^  \                 |   ^
///    |   v                v   |
///    +- Blocked   BlockedOnValidation -> {Done | Failed}
/// ```
///
/// `Pending` drops to `Blocked` while a dependency is unsatisfied; requeue
/// paths lead back to `Pending` from any non-terminal state. Terminal states
/// accept nothing, including a repeat of the same terminal write.
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn validate(from: TaskStatus, to: TaskStatus) -> Result<()> {
        use TaskStatus::*;

        let legal = match (from, to) {
            (Pending, Blocked) | (Pending, Assigned) => true,
            (Blocked, Pending) => true,
            (Assigned, InProgress) | (Assigned, Pending) => true,
            (InProgress, Done)
            | (InProgress, Failed)
            | (InProgress, BlockedOnValidation)
            | (InProgress, Pending) => true,
            (BlockedOnValidation, Done)
            | (BlockedOnValidation, Failed)
            | (BlockedOnValidation, InProgress) => true,
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidStateTransition { from, to })
        }
    }
}
