use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::storage::traits::Storage;
use crate::types::{
    Agent, AgentId, AgentStatus, CoherenceAssessment, Phase, PhaseId, Task, TaskId, TaskStatus,
    Workflow, WorkflowId, WorkflowState,
};

/// In-memory store backing tests and single-process runs. The write lock is
/// the single-writer view the compare-and-set primitives rely on.
#[derive(Clone)]
pub struct InMemoryStore {
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    phases: Arc<RwLock<HashMap<PhaseId, Phase>>>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
    assessments: Arc<RwLock<Vec<CoherenceAssessment>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(RwLock::new(HashMap::new())),
            phases: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            agents: Arc::new(RwLock::new(HashMap::new())),
            assessments: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut phases = self.phases.write().unwrap();
        for phase in &workflow.phases {
            phases.insert(phase.id, phase.clone());
        }
        let mut workflows = self.workflows.write().unwrap();
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        let workflows = self.workflows.read().unwrap();
        Ok(workflows.get(&id).cloned())
    }

    async fn set_workflow_state(&self, id: WorkflowId, state: WorkflowState) -> Result<()> {
        let mut workflows = self.workflows.write().unwrap();
        if let Some(workflow) = workflows.get_mut(&id) {
            workflow.state = state;
        }
        Ok(())
    }

    async fn get_phase(&self, id: PhaseId) -> Result<Option<Phase>> {
        let phases = self.phases.read().unwrap();
        Ok(phases.get(&id).cloned())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.values().cloned().collect())
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, id: TaskId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks
            .values()
            .filter(|t| t.depends_on.contains(&id))
            .cloned()
            .collect())
    }

    async fn compare_and_set_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&id) {
            Some(task) if task.status == expected => {
                task.status = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_task(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Assigned;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn start_task(&self, id: TaskId, agent_id: AgentId) -> Result<bool> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Assigned
                    && task.assigned_agent.map_or(true, |a| a == agent_id) =>
            {
                task.status = TaskStatus::InProgress;
                task.assigned_agent = Some(agent_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_task(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&id) {
            Some(task) if !task.status.is_terminal() => {
                let prior = task.status;
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                Ok(Some(prior))
            }
            _ => Ok(None),
        }
    }

    async fn set_failure_reason(&self, id: TaskId, reason: &str) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.failure_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn clear_task_agent(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.assigned_agent = None;
        }
        Ok(())
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.write().unwrap();
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let agents = self.agents.read().unwrap();
        Ok(agents.get(&id).cloned())
    }

    async fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let agents = self.agents.read().unwrap();
        Ok(agents
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn compare_and_set_agent_status(
        &self,
        id: AgentId,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool> {
        let mut agents = self.agents.write().unwrap();
        match agents.get_mut(&id) {
            Some(agent) if agent.status == expected => {
                agent.status = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_agent_output(&self, id: AgentId, at: DateTime<Utc>) -> Result<()> {
        let mut agents = self.agents.write().unwrap();
        if let Some(agent) = agents.get_mut(&id) {
            agent.last_output_at = at;
        }
        Ok(())
    }

    async fn record_steering(&self, id: AgentId) -> Result<()> {
        let mut agents = self.agents.write().unwrap();
        if let Some(agent) = agents.get_mut(&id) {
            agent.steering_count += 1;
            agent.consecutive_low_ticks += 1;
        }
        Ok(())
    }

    async fn reset_low_streak(&self, id: AgentId) -> Result<()> {
        let mut agents = self.agents.write().unwrap();
        if let Some(agent) = agents.get_mut(&id) {
            agent.consecutive_low_ticks = 0;
        }
        Ok(())
    }

    async fn record_assessment(&self, assessment: &CoherenceAssessment) -> Result<()> {
        let mut assessments = self.assessments.write().unwrap();
        assessments.push(assessment.clone());
        Ok(())
    }

    async fn assessments_for(&self, agent_id: AgentId) -> Result<Vec<CoherenceAssessment>> {
        let assessments = self.assessments.read().unwrap();
        Ok(assessments
            .iter()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect())
    }
}
