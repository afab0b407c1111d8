use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Agent, AgentId, AgentStatus, CoherenceAssessment, Phase, PhaseId, Task, TaskId, TaskStatus,
    Workflow, WorkflowId, WorkflowState,
};

/// The single authoritative store for canonical task and agent state.
///
/// Three independent drivers (dispatch, lifecycle, coherence monitor) only
/// synchronize through this trait; they never call each other directly. All
/// status races resolve through the compare-and-set primitives rather than
/// read-then-write, so callers stay stateless over the store.
#[async_trait]
pub trait Storage: Send + Sync {
    // Workflow & phase operations
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>>;
    async fn set_workflow_state(&self, id: WorkflowId, state: WorkflowState) -> Result<()>;
    async fn get_phase(&self, id: PhaseId) -> Result<Option<Phase>>;

    // Task operations
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    /// Tasks whose dependency set contains `id`.
    async fn dependents_of(&self, id: TaskId) -> Result<Vec<Task>>;

    /// Atomic status CAS. Returns `false` when the current status no longer
    /// matches `expected` (somebody else won the race).
    async fn compare_and_set_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool>;

    /// CAS `Pending -> Assigned`, the scheduler's select-then-mark step.
    async fn claim_task(&self, id: TaskId) -> Result<bool>;

    /// CAS `Assigned -> InProgress` that also binds the agent. Fails when the
    /// task is already bound to a different agent.
    async fn start_task(&self, id: TaskId, agent_id: AgentId) -> Result<bool>;

    /// Force a non-terminal task back to `Pending`, clearing its agent
    /// binding. Returns the prior status, or `None` for terminal tasks.
    async fn requeue_task(&self, id: TaskId) -> Result<Option<TaskStatus>>;

    async fn set_failure_reason(&self, id: TaskId, reason: &str) -> Result<()>;
    async fn clear_task_agent(&self, id: TaskId) -> Result<()>;

    // Agent operations
    async fn create_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>>;
    async fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>>;

    async fn compare_and_set_agent_status(
        &self,
        id: AgentId,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool>;

    /// Refresh the heartbeat timestamp after observing session output.
    async fn touch_agent_output(&self, id: AgentId, at: DateTime<Utc>) -> Result<()>;

    /// Increment the steering counter and the consecutive-low-tick streak.
    async fn record_steering(&self, id: AgentId) -> Result<()>;

    /// Reset the consecutive-low-tick streak after a passing score.
    async fn reset_low_streak(&self, id: AgentId) -> Result<()>;

    // Coherence assessments
    async fn record_assessment(&self, assessment: &CoherenceAssessment) -> Result<()>;
    async fn assessments_for(&self, agent_id: AgentId) -> Result<Vec<CoherenceAssessment>>;
}
