use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::path::PathBuf;

use crate::storage::traits::Storage;
use crate::types::{
    Agent, AgentId, AgentStatus, CoherenceAssessment, Phase, PhaseId, Priority, Task, TaskId,
    TaskStatus, Workflow, WorkflowId, WorkflowState,
};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task> {
        let status_str: String = row.get("status");
        let priority_str: String = row.get("priority");
        Ok(Task {
            id: row.get("id"),
            description: row.get("description"),
            phase_id: row.get("phase_id"),
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
            priority: Priority::parse(&priority_str).unwrap_or_default(),
            assigned_agent: row.get("assigned_agent"),
            created_at: row.get("created_at"),
            depends_on: row.get("depends_on"),
            origin_agent: row.get("origin_agent"),
            failure_reason: row.get("failure_reason"),
        })
    }

    fn agent_from_row(row: &sqlx::postgres::PgRow) -> Result<Agent> {
        let status_str: String = row.get("status");
        let workspace: String = row.get("workspace");
        Ok(Agent {
            id: row.get("id"),
            status: AgentStatus::parse(&status_str).unwrap_or(AgentStatus::Terminated),
            task_id: row.get("task_id"),
            phase_id: row.get("phase_id"),
            session_id: row.get("session_id"),
            workspace: PathBuf::from(workspace),
            created_at: row.get("created_at"),
            last_output_at: row.get("last_output_at"),
            steering_count: row.get::<i32, _>("steering_count") as u32,
            consecutive_low_ticks: row.get::<i32, _>("consecutive_low_ticks") as u32,
        })
    }

    const TASK_COLUMNS: &'static str = "id, description, phase_id, status, priority, \
         assigned_agent, created_at, depends_on, origin_agent, failure_reason";

    const AGENT_COLUMNS: &'static str = "id, status, task_id, phase_id, session_id, workspace, \
         created_at, last_output_at, steering_count, consecutive_low_ticks";
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, state, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.state.as_str())
        .execute(&self.pool)
        .await?;

        for phase in &workflow.phases {
            sqlx::query(
                r#"
                INSERT INTO phases (id, workflow_id, ordinal, name, instructions,
                                    completion_criteria, allowed_capabilities)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(phase.id)
            .bind(workflow.id)
            .bind(phase.ordinal as i32)
            .bind(&phase.name)
            .bind(&phase.instructions)
            .bind(&phase.completion_criteria)
            .bind(&phase.allowed_capabilities)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT id, name, state FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let phase_rows = sqlx::query(
            r#"
            SELECT id, ordinal, name, instructions, completion_criteria, allowed_capabilities
            FROM phases
            WHERE workflow_id = $1
            ORDER BY ordinal ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let phases = phase_rows
            .iter()
            .map(|r| Phase {
                id: r.get("id"),
                ordinal: r.get::<i32, _>("ordinal") as u32,
                name: r.get("name"),
                instructions: r.get("instructions"),
                completion_criteria: r.get("completion_criteria"),
                allowed_capabilities: r.get("allowed_capabilities"),
            })
            .collect();

        let state_str: String = row.get("state");
        let state = match state_str.as_str() {
            "Stopped" => WorkflowState::Stopped,
            _ => WorkflowState::Running,
        };

        Ok(Some(Workflow {
            id: row.get("id"),
            name: row.get("name"),
            state,
            phases,
        }))
    }

    async fn set_workflow_state(&self, id: WorkflowId, state: WorkflowState) -> Result<()> {
        sqlx::query("UPDATE workflows SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_phase(&self, id: PhaseId) -> Result<Option<Phase>> {
        let row = sqlx::query(
            r#"
            SELECT id, ordinal, name, instructions, completion_criteria, allowed_capabilities
            FROM phases
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Phase {
            id: r.get("id"),
            ordinal: r.get::<i32, _>("ordinal") as u32,
            name: r.get("name"),
            instructions: r.get("instructions"),
            completion_criteria: r.get("completion_criteria"),
            allowed_capabilities: r.get("allowed_capabilities"),
        }))
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, description, phase_id, status, priority, assigned_agent,
                               created_at, depends_on, origin_agent, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id)
        .bind(&task.description)
        .bind(task.phase_id)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.assigned_agent)
        .bind(task.created_at)
        .bind(&task.depends_on)
        .bind(task.origin_agent)
        .bind(&task.failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE id = $1",
            Self::TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks ORDER BY created_at ASC",
            Self::TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE status = $1 ORDER BY created_at ASC",
            Self::TASK_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn dependents_of(&self, id: TaskId) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE $1 = ANY(depends_on)",
            Self::TASK_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn compare_and_set_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(expected.as_str())
            .bind(next.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'Assigned' WHERE id = $1 AND status = 'Pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn start_task(&self, id: TaskId, agent_id: AgentId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'InProgress', assigned_agent = $2
            WHERE id = $1 AND status = 'Assigned'
              AND (assigned_agent IS NULL OR assigned_agent = $2)
            "#,
        )
        .bind(id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_task(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let row = sqlx::query(
            r#"
            UPDATE tasks new SET status = 'Pending', assigned_agent = NULL
            FROM tasks old
            WHERE new.id = old.id AND new.id = $1
              AND new.status NOT IN ('Done', 'Failed')
            RETURNING old.status AS prior_status
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let prior: String = r.get("prior_status");
            TaskStatus::parse(&prior)
        }))
    }

    async fn set_failure_reason(&self, id: TaskId, reason: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET failure_reason = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_task_agent(&self, id: TaskId) -> Result<()> {
        sqlx::query("UPDATE tasks SET assigned_agent = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, status, task_id, phase_id, session_id, workspace,
                                created_at, last_output_at, steering_count, consecutive_low_ticks)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(agent.id)
        .bind(agent.status.as_str())
        .bind(agent.task_id)
        .bind(agent.phase_id)
        .bind(&agent.session_id)
        .bind(agent.workspace.to_string_lossy().to_string())
        .bind(agent.created_at)
        .bind(agent.last_output_at)
        .bind(agent.steering_count as i32)
        .bind(agent.consecutive_low_ticks as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE id = $1",
            Self::AGENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::agent_from_row).transpose()
    }

    async fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE status = $1 ORDER BY created_at ASC",
            Self::AGENT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::agent_from_row).collect()
    }

    async fn compare_and_set_agent_status(
        &self,
        id: AgentId,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(expected.as_str())
            .bind(next.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_agent_output(&self, id: AgentId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE agents SET last_output_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_steering(&self, id: AgentId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET steering_count = steering_count + 1,
                consecutive_low_ticks = consecutive_low_ticks + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_low_streak(&self, id: AgentId) -> Result<()> {
        sqlx::query("UPDATE agents SET consecutive_low_ticks = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_assessment(&self, assessment: &CoherenceAssessment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coherence_assessments (agent_id, task_id, score, rationale, steering, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(assessment.agent_id)
        .bind(assessment.task_id)
        .bind(assessment.score)
        .bind(&assessment.rationale)
        .bind(&assessment.steering)
        .bind(assessment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn assessments_for(&self, agent_id: AgentId) -> Result<Vec<CoherenceAssessment>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, task_id, score, rationale, steering, created_at
            FROM coherence_assessments
            WHERE agent_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| CoherenceAssessment {
                agent_id: r.get("agent_id"),
                task_id: r.get("task_id"),
                score: r.get("score"),
                rationale: r.get("rationale"),
                steering: r.get("steering"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
