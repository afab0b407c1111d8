pub mod agent;
pub mod phase;
pub mod task;

pub use agent::Agent;
pub use phase::{Phase, Workflow};
pub use task::{Task, TaskDraft};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;
pub type AgentId = Uuid;
pub type PhaseId = Uuid;
pub type WorkflowId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,             // Eligible for selection once dependencies clear
    Blocked,             // At least one dependency not yet Done
    Assigned,            // Claimed by the scheduler, worker not yet running
    InProgress,          // A live agent is working on it
    BlockedOnValidation, // Awaiting policy-gated validation before Done
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Blocked => "Blocked",
            TaskStatus::Assigned => "Assigned",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::BlockedOnValidation => "BlockedOnValidation",
            TaskStatus::Done => "Done",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(TaskStatus::Pending),
            "Blocked" => Some(TaskStatus::Blocked),
            "Assigned" => Some(TaskStatus::Assigned),
            "InProgress" => Some(TaskStatus::InProgress),
            "BlockedOnValidation" => Some(TaskStatus::BlockedOnValidation),
            "Done" => Some(TaskStatus::Done),
            "Failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Working,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Idle => "Idle",
            AgentStatus::Working => "Working",
            AgentStatus::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(AgentStatus::Idle),
            "Working" => Some(AgentStatus::Working),
            "Terminated" => Some(AgentStatus::Terminated),
            _ => None,
        }
    }
}

/// Ordinal priority. The derived `Ord` follows declaration order, so
/// `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Running,
    Stopped,
}

impl WorkflowState {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowState::Running => "Running",
            WorkflowState::Stopped => "Stopped",
        }
    }
}

/// Per-tick judgment of how well a working agent tracks its phase goal.
/// Side information only, never required for scheduling correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceAssessment {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub score: f32,
    pub rationale: String,
    pub steering: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::BlockedOnValidation.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::BlockedOnValidation,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }
}
