use thiserror::Error;
use uuid::Uuid;

use crate::types::TaskStatus;

/// Error taxonomy for the orchestration core. Transient collaborator
/// failures (session launch, oracle calls, workspace I/O) are recovered
/// locally via retry or requeue and never abort the orchestration loop;
/// state-consistency violations are rejected loudly, never silently fixed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    #[error("not found: {0}")]
    NotFound(Uuid),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("workspace provisioning failed: {0}")]
    Provisioning(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::InvalidStateTransition {
            from: TaskStatus::Done,
            to: TaskStatus::Pending,
        };
        assert!(err.to_string().contains("Done"));
        assert!(err.to_string().contains("Pending"));
    }
}
