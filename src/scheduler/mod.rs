pub mod state_machine;

pub use state_machine::TaskStateMachine;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::OrchestratorConfig;
use crate::errors::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestrationEvent};
use crate::storage::Storage;
use crate::types::{AgentId, PhaseId, Task, TaskDraft, TaskId, TaskStatus};

/// Selects the next eligible task for each free capacity slot and owns the
/// task status state machine. The scheduler is a stateless processor over the
/// store: the select-then-mark step goes through the store's claim CAS, so no
/// two concurrent calls can select the same task.
pub struct Scheduler {
    store: Arc<dyn Storage>,
    config: OrchestratorConfig,
    events: EventBus,
    /// Signalled on enqueue and on terminal transitions so the dispatch loop
    /// wakes without polling.
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Storage>, config: OrchestratorConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Validate and persist a task submission. Workers call this too: the
    /// graph grows while it runs.
    pub async fn enqueue(&self, draft: TaskDraft) -> Result<TaskId> {
        if draft.description.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "task description must not be empty".to_string(),
            ));
        }
        let phase = self.store.get_phase(draft.phase_id).await?;
        if phase.is_none() {
            return Err(OrchestratorError::Validation(format!(
                "unknown phase: {}",
                draft.phase_id
            )));
        }

        let task = Task::from_draft(draft);
        let task_id = task.id;
        self.store.create_task(&task).await?;

        self.events
            .emit(OrchestrationEvent::TaskEnqueued { task_id });
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Pick up to `capacity` eligible pending tasks, claiming each one
    /// atomically. Eligibility requires every dependency to be `Done`; the
    /// dependency gate is hard, a `Failed` blocker never satisfies it.
    ///
    /// Ranking is a deterministic total order: priority desc, phase ordinal
    /// asc, creation time asc, id asc.
    pub async fn select_next(&self, capacity: usize) -> Result<Vec<Task>> {
        let active = self.active_counts().await?;
        let free_global = self
            .config
            .max_concurrent_tasks
            .saturating_sub(active.values().sum::<usize>());
        let slots = capacity.min(free_global);
        if slots == 0 {
            return Ok(Vec::new());
        }

        // Blocked tasks whose blockers have since completed come back into
        // the candidate set; new nodes and edges may have appeared between
        // any two selection cycles.
        let mut candidates = self.store.list_tasks_by_status(TaskStatus::Pending).await?;
        candidates.extend(self.store.list_tasks_by_status(TaskStatus::Blocked).await?);

        let mut eligible = Vec::new();
        for task in candidates {
            match self.dependencies_satisfied(&task).await? {
                true => {
                    if task.status == TaskStatus::Blocked {
                        // Bring it back before claiming; a lost race just
                        // means another driver already did.
                        self.store
                            .compare_and_set_task_status(
                                task.id,
                                TaskStatus::Blocked,
                                TaskStatus::Pending,
                            )
                            .await?;
                    }
                    eligible.push(task);
                }
                false => {
                    if task.status == TaskStatus::Pending {
                        self.store
                            .compare_and_set_task_status(
                                task.id,
                                TaskStatus::Pending,
                                TaskStatus::Blocked,
                            )
                            .await?;
                    }
                }
            }
        }

        let ordinals = self.phase_ordinals(&eligible).await?;
        eligible.sort_by(|a, b| Self::rank(a, b, &ordinals));

        let mut selected = Vec::new();
        let mut phase_active: HashMap<PhaseId, usize> = active;
        for task in eligible {
            if selected.len() == slots {
                break;
            }
            if let Some(limit) = self.config.per_phase_limit {
                if phase_active.get(&task.phase_id).copied().unwrap_or(0) >= limit {
                    continue;
                }
            }
            // Check-and-set: losing the claim means a concurrent selection
            // cycle got there first, which is fine.
            if self.store.claim_task(task.id).await? {
                *phase_active.entry(task.phase_id).or_insert(0) += 1;
                let mut claimed = task;
                claimed.status = TaskStatus::Assigned;
                self.events.emit(OrchestrationEvent::TaskStatusChanged {
                    task_id: claimed.id,
                    from: TaskStatus::Pending,
                    to: TaskStatus::Assigned,
                    agent_id: None,
                });
                selected.push(claimed);
            }
        }

        Ok(selected)
    }

    /// Apply a status transition reported by a worker or by the lifecycle
    /// manager. Illegal transitions are rejected with the state unchanged;
    /// terminal writes clear the agent binding and release blocked
    /// dependents.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        new_status: TaskStatus,
        agent_id: Option<AgentId>,
        reason: Option<&str>,
    ) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(OrchestratorError::NotFound(task_id))?;

        TaskStateMachine::validate(task.status, new_status)?;

        let updated = self
            .store
            .compare_and_set_task_status(task_id, task.status, new_status)
            .await?;
        if !updated {
            // Someone else transitioned the task between our read and the
            // CAS. Report against the fresh status rather than guessing.
            let current = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(OrchestratorError::NotFound(task_id))?;
            log::warn!(
                "task {} status race: expected {:?}, found {:?}",
                task_id,
                task.status,
                current.status
            );
            return Err(OrchestratorError::InvalidStateTransition {
                from: current.status,
                to: new_status,
            });
        }

        if new_status == TaskStatus::Failed {
            if let Some(reason) = reason {
                self.store.set_failure_reason(task_id, reason).await?;
            }
        }

        self.events.emit(OrchestrationEvent::TaskStatusChanged {
            task_id,
            from: task.status,
            to: new_status,
            agent_id,
        });

        if new_status.is_terminal() {
            self.store.clear_task_agent(task_id).await?;
            self.release_dependents(task_id).await?;
            self.notify.notify_one();
        }

        Ok(())
    }

    /// Force a non-terminal task back to `Pending`, clearing its agent
    /// binding. Used by orphan reconciliation and by workflow shutdown.
    pub async fn requeue(&self, task_id: TaskId) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(OrchestratorError::NotFound(task_id))?;

        match self.store.requeue_task(task_id).await? {
            Some(prior) => {
                self.events
                    .emit(OrchestrationEvent::TaskRequeued { task_id, prior });
                self.notify.notify_one();
                Ok(())
            }
            None => Err(OrchestratorError::InvalidStateTransition {
                from: task.status,
                to: TaskStatus::Pending,
            }),
        }
    }

    /// On a blocker reaching `Done`, move any `Blocked` dependent whose full
    /// dependency set is now satisfied back to `Pending`.
    async fn release_dependents(&self, blocker: TaskId) -> Result<()> {
        for dependent in self.store.dependents_of(blocker).await? {
            if dependent.status != TaskStatus::Blocked {
                continue;
            }
            if self.dependencies_satisfied(&dependent).await? {
                self.store
                    .compare_and_set_task_status(
                        dependent.id,
                        TaskStatus::Blocked,
                        TaskStatus::Pending,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        for dep_id in &task.depends_on {
            let dep = self.store.get_task(*dep_id).await?;
            match dep {
                Some(dep) if dep.status == TaskStatus::Done => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn active_counts(&self) -> Result<HashMap<PhaseId, usize>> {
        let mut counts = HashMap::new();
        for status in [
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::BlockedOnValidation,
        ] {
            for task in self.store.list_tasks_by_status(status).await? {
                *counts.entry(task.phase_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn phase_ordinals(&self, tasks: &[Task]) -> Result<HashMap<PhaseId, u32>> {
        let mut ordinals = HashMap::new();
        for task in tasks {
            if !ordinals.contains_key(&task.phase_id) {
                let ordinal = self
                    .store
                    .get_phase(task.phase_id)
                    .await?
                    .map(|p| p.ordinal)
                    .unwrap_or(u32::MAX);
                ordinals.insert(task.phase_id, ordinal);
            }
        }
        Ok(ordinals)
    }

    fn rank(a: &Task, b: &Task, ordinals: &HashMap<PhaseId, u32>) -> Ordering {
        let ord_a = ordinals.get(&a.phase_id).copied().unwrap_or(u32::MAX);
        let ord_b = ordinals.get(&b.phase_id).copied().unwrap_or(u32::MAX);
        b.priority
            .cmp(&a.priority)
            .then(ord_a.cmp(&ord_b))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::{Phase, Priority, Workflow};
    use chrono::{Duration, Utc};

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<InMemoryStore>,
        phases: Vec<Phase>,
    }

    async fn fixture(phase_count: u32) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let phases: Vec<Phase> = (1..=phase_count)
            .map(|ordinal| Phase {
                id: PhaseId::new_v4(),
                ordinal,
                name: format!("phase-{}", ordinal),
                instructions: format!("do phase {}", ordinal),
                completion_criteria: String::new(),
                allowed_capabilities: vec![],
            })
            .collect();
        let workflow = Workflow::new("test".to_string(), phases.clone());
        store.create_workflow(&workflow).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            OrchestratorConfig::default(),
            EventBus::default(),
        );
        Fixture {
            scheduler,
            store,
            phases,
        }
    }

    fn draft(description: &str, phase_id: PhaseId, priority: Priority) -> TaskDraft {
        TaskDraft {
            description: description.to_string(),
            phase_id,
            priority,
            depends_on: vec![],
            origin_agent: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_description() {
        let f = fixture(1).await;
        let result = f
            .scheduler
            .enqueue(draft("   ", f.phases[0].id, Priority::Medium))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_phase() {
        let f = fixture(1).await;
        let result = f
            .scheduler
            .enqueue(draft("work", PhaseId::new_v4(), Priority::Medium))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_selection_order_is_deterministic() {
        // T1(high, phase 1, t=10), T2(high, phase 1, t=5), T3(medium, phase 1, t=1):
        // T2 wins the single slot on the earlier timestamp.
        let f = fixture(1).await;
        let phase = f.phases[0].id;
        let base = Utc::now();

        let mut t1 = Task::from_draft(draft("t1", phase, Priority::High));
        t1.created_at = base + Duration::seconds(10);
        let mut t2 = Task::from_draft(draft("t2", phase, Priority::High));
        t2.created_at = base + Duration::seconds(5);
        let mut t3 = Task::from_draft(draft("t3", phase, Priority::Medium));
        t3.created_at = base + Duration::seconds(1);

        for t in [&t1, &t2, &t3] {
            f.store.create_task(t).await.unwrap();
        }

        let selected = f.scheduler.select_next(1).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, t2.id);

        let selected = f.scheduler.select_next(2).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].id, t1.id);
        assert_eq!(selected[1].id, t3.id);
    }

    #[tokio::test]
    async fn test_earlier_phase_wins_on_priority_tie() {
        let f = fixture(2).await;
        let base = Utc::now();

        let mut later_phase = Task::from_draft(draft("p2", f.phases[1].id, Priority::High));
        later_phase.created_at = base;
        let mut earlier_phase = Task::from_draft(draft("p1", f.phases[0].id, Priority::High));
        earlier_phase.created_at = base + Duration::seconds(30);

        f.store.create_task(&later_phase).await.unwrap();
        f.store.create_task(&earlier_phase).await.unwrap();

        let selected = f.scheduler.select_next(1).await.unwrap();
        assert_eq!(selected[0].id, earlier_phase.id);
    }

    #[tokio::test]
    async fn test_dependency_gate() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;

        let blocker = f
            .scheduler
            .enqueue(draft("t5 blocker", phase, Priority::Medium))
            .await
            .unwrap();
        let dependent_id = f
            .scheduler
            .enqueue(TaskDraft {
                description: "t4 dependent".to_string(),
                phase_id: phase,
                priority: Priority::High,
                depends_on: vec![blocker],
                origin_agent: None,
            })
            .await
            .unwrap();

        // Only the blocker is eligible, despite the dependent's higher
        // priority; the dependent drops to Blocked.
        let selected = f.scheduler.select_next(4).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, blocker);
        let dependent = f.store.get_task(dependent_id).await.unwrap().unwrap();
        assert_eq!(dependent.status, TaskStatus::Blocked);

        // Drive the blocker to Done and the dependent becomes eligible.
        let agent = AgentId::new_v4();
        f.store.start_task(blocker, agent).await.unwrap();
        f.scheduler
            .update_status(blocker, TaskStatus::Done, Some(agent), None)
            .await
            .unwrap();

        let selected = f.scheduler.select_next(4).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, dependent_id);
    }

    #[tokio::test]
    async fn test_failed_dependency_never_satisfies() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;

        let blocker = f
            .scheduler
            .enqueue(draft("blocker", phase, Priority::Medium))
            .await
            .unwrap();
        let dependent = f
            .scheduler
            .enqueue(TaskDraft {
                description: "dependent".to_string(),
                phase_id: phase,
                priority: Priority::Medium,
                depends_on: vec![blocker],
                origin_agent: None,
            })
            .await
            .unwrap();

        f.store.claim_task(blocker).await.unwrap();
        let agent = AgentId::new_v4();
        f.store.start_task(blocker, agent).await.unwrap();
        f.scheduler
            .update_status(blocker, TaskStatus::Failed, Some(agent), Some("boom"))
            .await
            .unwrap();

        let selected = f.scheduler.select_next(4).await.unwrap();
        assert!(selected.is_empty());
        let dep = f.store.get_task(dependent).await.unwrap().unwrap();
        assert_eq!(dep.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;
        for i in 0..8 {
            f.scheduler
                .enqueue(draft(&format!("task {}", i), phase, Priority::Medium))
                .await
                .unwrap();
        }

        // Default global ceiling is 4; asking for more cannot exceed it.
        let selected = f.scheduler.select_next(8).await.unwrap();
        assert_eq!(selected.len(), 4);

        let more = f.scheduler.select_next(8).await.unwrap();
        assert!(more.is_empty());
    }

    #[tokio::test]
    async fn test_update_status_unknown_task() {
        let f = fixture(1).await;
        let result = f
            .scheduler
            .update_status(TaskId::new_v4(), TaskStatus::Done, None, None)
            .await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_double_terminal_is_rejected() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;
        let task_id = f
            .scheduler
            .enqueue(draft("work", phase, Priority::Medium))
            .await
            .unwrap();

        f.store.claim_task(task_id).await.unwrap();
        let agent = AgentId::new_v4();
        f.store.start_task(task_id, agent).await.unwrap();

        f.scheduler
            .update_status(task_id, TaskStatus::Done, Some(agent), None)
            .await
            .unwrap();
        let repeat = f
            .scheduler
            .update_status(task_id, TaskStatus::Done, Some(agent), None)
            .await;
        assert!(matches!(
            repeat,
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_reason_is_recorded() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;
        let task_id = f
            .scheduler
            .enqueue(draft("doomed", phase, Priority::Medium))
            .await
            .unwrap();
        f.store.claim_task(task_id).await.unwrap();
        let agent = AgentId::new_v4();
        f.store.start_task(task_id, agent).await.unwrap();

        f.scheduler
            .update_status(
                task_id,
                TaskStatus::Failed,
                Some(agent),
                Some("session crashed"),
            )
            .await
            .unwrap();

        let task = f.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.failure_reason.as_deref(), Some("session crashed"));
        assert!(task.assigned_agent.is_none());
    }

    #[tokio::test]
    async fn test_requeue_terminal_rejected() {
        let f = fixture(1).await;
        let phase = f.phases[0].id;
        let task_id = f
            .scheduler
            .enqueue(draft("work", phase, Priority::Medium))
            .await
            .unwrap();
        f.store.claim_task(task_id).await.unwrap();
        let agent = AgentId::new_v4();
        f.store.start_task(task_id, agent).await.unwrap();
        f.scheduler
            .update_status(task_id, TaskStatus::Done, Some(agent), None)
            .await
            .unwrap();

        assert!(f.scheduler.requeue(task_id).await.is_err());
    }
}
