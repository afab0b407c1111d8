use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, PhaseId, Priority, TaskId, TaskStatus};

/// A schedulable unit of work. Tasks are created at workflow bootstrap or by
/// any running worker, so the graph grows while it runs. Tasks are never
/// deleted; they only ever reach a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub phase_id: PhaseId,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub depends_on: Vec<TaskId>,
    /// Lineage: the worker that created this task, if any.
    pub origin_agent: Option<AgentId>,
    pub failure_reason: Option<String>,
}

/// Unvalidated submission, from an operator or from a running worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub description: String,
    pub phase_id: PhaseId,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub origin_agent: Option<AgentId>,
}

impl Task {
    pub fn from_draft(draft: TaskDraft) -> Self {
        Self {
            id: TaskId::new_v4(),
            description: draft.description,
            phase_id: draft.phase_id,
            status: TaskStatus::Pending,
            priority: draft.priority,
            assigned_agent: None,
            created_at: Utc::now(),
            depends_on: draft.depends_on,
            origin_agent: draft.origin_agent,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_draft_defaults() {
        let draft = TaskDraft {
            description: "index the repository".to_string(),
            phase_id: PhaseId::new_v4(),
            priority: Priority::High,
            depends_on: vec![],
            origin_agent: None,
        };

        let task = Task::from_draft(draft);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::High);
        assert!(task.assigned_agent.is_none());
        assert!(task.failure_reason.is_none());
    }
}
