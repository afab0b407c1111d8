pub mod session;
pub mod workspace;

pub use session::{
    MockSession, MockSessionProvisioner, ProcessSession, ProcessSessionProvisioner, Session,
    SessionProvisioner, SessionRegistry, WorkBrief,
};
pub use workspace::{LocalWorkspaces, WorkspaceProvisioner};

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::errors::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestrationEvent};
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::types::{Agent, AgentId, AgentStatus, Task, TaskStatus};

/// Turns a scheduled task into an isolated running worker and tears workers
/// down again. Owns every live session and its workspace for the agent's
/// lifetime; nothing else writes to either.
pub struct LifecycleManager {
    store: Arc<dyn Storage>,
    scheduler: Arc<Scheduler>,
    sessions: SessionRegistry,
    provisioner: Arc<dyn SessionProvisioner>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    retriever: Arc<dyn crate::providers::ContextRetriever>,
    config: OrchestratorConfig,
    events: EventBus,
    /// Shared project revision new workspaces derive from.
    base_revision: Option<PathBuf>,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Storage>,
        scheduler: Arc<Scheduler>,
        sessions: SessionRegistry,
        provisioner: Arc<dyn SessionProvisioner>,
        workspaces: Arc<dyn WorkspaceProvisioner>,
        retriever: Arc<dyn crate::providers::ContextRetriever>,
        config: OrchestratorConfig,
        events: EventBus,
        base_revision: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            scheduler,
            sessions,
            provisioner,
            workspaces,
            retriever,
            config,
            events,
            base_revision,
        }
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Provision a workspace, assemble the work brief, launch a session and
    /// persist the agent record. On failure the task stays `Assigned` and
    /// unbound; the orphan sweep requeues it.
    pub async fn spawn(&self, task: &Task) -> Result<Agent> {
        if let Some(existing) = task.assigned_agent {
            // A bound task reaching spawn means two drivers raced past the
            // claim CAS, which should be impossible.
            log::error!(
                "refusing to spawn for task {}: already bound to agent {}",
                task.id,
                existing
            );
            return Err(OrchestratorError::Spawn(format!(
                "task {} already bound to agent {}",
                task.id, existing
            )));
        }

        let phase = self
            .store
            .get_phase(task.phase_id)
            .await?
            .ok_or(OrchestratorError::NotFound(task.phase_id))?;

        let workspace = self
            .workspaces
            .provision(self.base_revision.as_deref(), task.id)
            .await
            .map_err(|e| OrchestratorError::Provisioning(e.to_string()))?;

        // Best-effort: a retrieval outage just means a thinner brief.
        let context_snippets = match self.retriever.retrieve(&task.description, 5, 0.5).await {
            Ok(snippets) => snippets.into_iter().map(|s| s.content).collect(),
            Err(e) => {
                log::warn!("context retrieval failed for task {}: {}", task.id, e);
                Vec::new()
            }
        };

        let brief = WorkBrief {
            phase_name: phase.name.clone(),
            phase_instructions: phase.instructions.clone(),
            task_description: task.description.clone(),
            context_snippets,
        };

        let session = match self.provisioner.launch(&workspace, &brief).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self.workspaces.release(&workspace).await;
                return Err(OrchestratorError::Spawn(e.to_string()));
            }
        };

        let agent = Agent::new(
            task.id,
            task.phase_id,
            session.id().to_string(),
            workspace.clone(),
        );
        if let Err(e) = self.store.create_agent(&agent).await {
            let _ = session.terminate().await;
            let _ = self.workspaces.release(&workspace).await;
            return Err(e.into());
        }

        if !self.store.start_task(task.id, agent.id).await? {
            // Lost the binding race (concurrent requeue or a second spawn).
            // Roll our half back and let the winner proceed.
            log::error!(
                "agent registration conflict for task {}: rolling back spawn",
                task.id
            );
            let _ = session.terminate().await;
            self.store
                .compare_and_set_agent_status(
                    agent.id,
                    AgentStatus::Working,
                    AgentStatus::Terminated,
                )
                .await?;
            let _ = self.workspaces.release(&workspace).await;
            return Err(OrchestratorError::Spawn(format!(
                "registration conflict for task {}",
                task.id
            )));
        }

        self.sessions.insert(session.clone());
        self.events.emit(OrchestrationEvent::AgentSpawned {
            agent_id: agent.id,
            task_id: task.id,
            session_id: agent.session_id.clone(),
        });
        log::info!(
            "spawned agent {} for task {} in {}",
            agent.id,
            task.id,
            agent.workspace.display()
        );

        Ok(agent)
    }

    /// True when the bound session is alive and produced output inside the
    /// grace window.
    pub async fn probe_liveness(&self, agent: &Agent) -> bool {
        let Some(session) = self.sessions.get(&agent.session_id) else {
            return false;
        };
        if !session.is_alive().await {
            return false;
        }
        let last = session.last_output_at().await.unwrap_or(agent.created_at);
        Utc::now().signed_duration_since(last).num_seconds() < self.config.grace_window_secs as i64
    }

    /// Reconcile orphans: silent or dead agents, dangling sessions, and
    /// `Assigned` tasks nobody ever bound. The grace window spares freshly
    /// spawned agents that are still warming up.
    pub async fn reconcile_orphans(&self) -> Result<Vec<AgentId>> {
        let now = Utc::now();
        let grace = self.config.grace_window_secs as i64;
        let mut reaped = Vec::new();

        for agent in self.store.list_agents_by_status(AgentStatus::Working).await? {
            // Refresh the heartbeat from the live session before judging.
            let session = self.sessions.get(&agent.session_id);
            let mut last_output = agent.last_output_at;
            if let Some(ref session) = session {
                if let Some(observed) = session.last_output_at().await {
                    if observed > last_output {
                        last_output = observed;
                        self.store.touch_agent_output(agent.id, observed).await?;
                    }
                }
            }

            let alive = match session {
                Some(ref s) => s.is_alive().await,
                None => false,
            };
            let silent = now.signed_duration_since(last_output).num_seconds() >= grace;
            if (alive && !silent) || agent.age_secs(now) < grace {
                continue;
            }

            // CAS guards the sweep: whoever flips Working -> Terminated does
            // the cleanup exactly once.
            if !self
                .store
                .compare_and_set_agent_status(
                    agent.id,
                    AgentStatus::Working,
                    AgentStatus::Terminated,
                )
                .await?
            {
                continue;
            }

            log::warn!(
                "orphan agent {} (session {} silent {}s): terminating and requeueing task {}",
                agent.id,
                agent.session_id,
                now.signed_duration_since(last_output).num_seconds(),
                agent.task_id
            );

            if let Some(session) = self.sessions.remove(&agent.session_id) {
                let _ = session.terminate().await;
            }
            if self.config.retain_failed_workspaces {
                log::debug!(
                    "retaining workspace {} for diagnosis",
                    agent.workspace.display()
                );
            } else {
                self.release_workspace(&agent).await;
            }

            if let Err(e) = self.scheduler.requeue(agent.task_id).await {
                // Already terminal means nothing to recover.
                log::debug!("orphan task {} not requeued: {}", agent.task_id, e);
            }
            self.events.emit(OrchestrationEvent::AgentTerminated {
                agent_id: agent.id,
                reason: "orphan".to_string(),
            });
            reaped.push(agent.id);
        }

        self.kill_dangling_sessions().await?;
        self.requeue_unbound_assigned().await?;

        Ok(reaped)
    }

    /// Close an agent's session and mark it terminated. Idempotent: the agent
    /// status CAS makes repeat calls no-ops.
    pub async fn teardown(&self, agent_id: AgentId, reason: &str, retain_workspace: bool) -> Result<()> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Err(OrchestratorError::NotFound(agent_id));
        };

        if !self
            .store
            .compare_and_set_agent_status(agent_id, AgentStatus::Working, AgentStatus::Terminated)
            .await?
        {
            return Ok(());
        }

        if let Some(session) = self.sessions.remove(&agent.session_id) {
            let _ = session.terminate().await;
        }
        if !retain_workspace {
            self.release_workspace(&agent).await;
        }

        self.events.emit(OrchestrationEvent::AgentTerminated {
            agent_id,
            reason: reason.to_string(),
        });
        log::info!("tore down agent {} ({})", agent_id, reason);
        Ok(())
    }

    /// Stop everything: terminate every live session, release workspaces,
    /// and requeue whatever was in flight. No task is left
    /// `Assigned`/`InProgress` without a live agent.
    pub async fn shutdown(&self) -> Result<()> {
        for agent in self.store.list_agents_by_status(AgentStatus::Working).await? {
            self.teardown(agent.id, "workflow stopped", false).await?;
            if let Err(e) = self.scheduler.requeue(agent.task_id).await {
                log::debug!("task {} not requeued on shutdown: {}", agent.task_id, e);
            }
        }
        self.requeue_unbound_assigned().await?;

        // Anything still registered has no agent record; kill it anyway.
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.remove(&id) {
                let _ = session.terminate().await;
            }
        }
        Ok(())
    }

    async fn release_workspace(&self, agent: &Agent) {
        if let Err(e) = self.workspaces.release(&agent.workspace).await {
            log::warn!(
                "failed to release workspace {}: {}",
                agent.workspace.display(),
                e
            );
        }
    }

    /// Sessions with no matching live agent record are orphans too.
    async fn kill_dangling_sessions(&self) -> Result<()> {
        let working = self.store.list_agents_by_status(AgentStatus::Working).await?;
        for id in self.sessions.ids() {
            if working.iter().any(|a| a.session_id == id) {
                continue;
            }
            if let Some(session) = self.sessions.remove(&id) {
                log::warn!("terminating dangling session {}", id);
                let _ = session.terminate().await;
            }
        }
        Ok(())
    }

    /// A spawn failure leaves its task `Assigned` with no agent; push it back
    /// to `Pending` so selection retries it.
    async fn requeue_unbound_assigned(&self) -> Result<()> {
        for task in self.store.list_tasks_by_status(TaskStatus::Assigned).await? {
            if task.assigned_agent.is_some() {
                continue;
            }
            // Racing a just-claimed task is harmless: the spawn's binding
            // CAS fails and the spawn rolls itself back.
            if let Err(e) = self.scheduler.requeue(task.id).await {
                log::debug!("unbound task {} not requeued: {}", task.id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NullRetriever;
    use crate::storage::InMemoryStore;
    use crate::types::{Phase, PhaseId, Priority, TaskDraft, Workflow};
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        scheduler: Arc<Scheduler>,
        manager: LifecycleManager,
        provisioner: Arc<MockSessionProvisioner>,
        workspace_root: tempfile::TempDir,
        phase_id: PhaseId,
    }

    async fn fixture(config: OrchestratorConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let phase = Phase {
            id: PhaseId::new_v4(),
            ordinal: 1,
            name: "implementation".to_string(),
            instructions: "write code".to_string(),
            completion_criteria: String::new(),
            allowed_capabilities: vec![],
        };
        let phase_id = phase.id;
        store
            .create_workflow(&Workflow::new("wf".to_string(), vec![phase]))
            .await
            .unwrap();

        let events = EventBus::default();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            config.clone(),
            events.clone(),
        ));
        let provisioner = Arc::new(MockSessionProvisioner::new());
        let workspace_root = tempfile::tempdir().unwrap();
        let manager = LifecycleManager::new(
            store.clone(),
            scheduler.clone(),
            SessionRegistry::new(),
            provisioner.clone(),
            Arc::new(LocalWorkspaces::new(workspace_root.path().to_path_buf())),
            Arc::new(NullRetriever),
            config,
            events,
            None,
        );

        Fixture {
            store,
            scheduler,
            manager,
            provisioner,
            workspace_root,
            phase_id,
        }
    }

    async fn claimed_task(f: &Fixture, description: &str) -> Task {
        let id = f
            .scheduler
            .enqueue(TaskDraft {
                description: description.to_string(),
                phase_id: f.phase_id,
                priority: Priority::Medium,
                depends_on: vec![],
                origin_agent: None,
            })
            .await
            .unwrap();
        let mut selected = f.scheduler.select_next(1).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, id);
        selected.remove(0)
    }

    #[tokio::test]
    async fn test_spawn_binds_agent_and_starts_task() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "build the thing").await;

        let agent = f.manager.spawn(&task).await.unwrap();

        let stored_task = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored_task.status, TaskStatus::InProgress);
        assert_eq!(stored_task.assigned_agent, Some(agent.id));

        let stored_agent = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored_agent.status, AgentStatus::Working);
        assert!(f.manager.sessions.get(&agent.session_id).is_some());
        assert!(agent.workspace.starts_with(f.workspace_root.path()));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_task_assigned() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "doomed spawn").await;
        f.provisioner.fail_next_launch();

        let result = f.manager.spawn(&task).await;
        assert!(matches!(result, Err(OrchestratorError::Spawn(_))));

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert!(stored.assigned_agent.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_provisioned_workspace() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "doomed spawn").await;
        f.provisioner.fail_next_launch();

        let result = f.manager.spawn(&task).await;
        assert!(matches!(result, Err(OrchestratorError::Spawn(_))));

        let leftovers: Vec<_> = std::fs::read_dir(f.workspace_root.path())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "workspace left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_unbound_assigned_task_is_requeued_by_sweep() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "doomed spawn").await;
        f.provisioner.fail_next_launch();
        let _ = f.manager.spawn(&task).await;

        f.manager.reconcile_orphans().await.unwrap();

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_orphan_reaped_exactly_once() {
        let mut config = OrchestratorConfig::default();
        config.grace_window_secs = 60;
        let f = fixture(config).await;
        let task = claimed_task(&f, "goes silent").await;

        let session = MockSession::new("silent-session");
        f.provisioner.queue(session.clone());
        let agent = f.manager.spawn(&task).await.unwrap();

        // Backdate both the spawn and the last output past the grace window.
        let past = Utc::now() - Duration::seconds(300);
        session.set_last_output_at(Some(past));
        f.store.touch_agent_output(agent.id, past).await.unwrap();
        {
            // Age the agent record past the startup grace.
            let mut aged = f.store.get_agent(agent.id).await.unwrap().unwrap();
            aged.created_at = past;
            f.store.create_agent(&aged).await.unwrap();
        }

        let reaped = f.manager.reconcile_orphans().await.unwrap();
        assert_eq!(reaped, vec![agent.id]);
        assert_eq!(session.termination_count(), 1);

        let stored_task = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored_task.status, TaskStatus::Pending);
        assert!(stored_task.assigned_agent.is_none());

        let stored_agent = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored_agent.status, AgentStatus::Terminated);

        // Second sweep finds nothing; the session is not terminated again.
        let reaped = f.manager.reconcile_orphans().await.unwrap();
        assert!(reaped.is_empty());
        assert_eq!(session.termination_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_agent_survives_sweep() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "slow starter").await;

        let session = MockSession::new("fresh-session");
        session.set_last_output_at(None);
        f.provisioner.queue(session.clone());
        let agent = f.manager.spawn(&task).await.unwrap();

        let reaped = f.manager.reconcile_orphans().await.unwrap();
        assert!(reaped.is_empty());

        let stored = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Working);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "finishes fine").await;
        let session = MockSession::new("done-session");
        f.provisioner.queue(session.clone());
        let agent = f.manager.spawn(&task).await.unwrap();

        f.manager.teardown(agent.id, "task done", false).await.unwrap();
        f.manager.teardown(agent.id, "task done", false).await.unwrap();

        assert_eq!(session.termination_count(), 1);
        assert!(f.manager.sessions.get(&agent.session_id).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_requeues_in_flight_work() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "interrupted").await;
        let session = MockSession::new("live-session");
        f.provisioner.queue(session.clone());
        let agent = f.manager.spawn(&task).await.unwrap();

        f.manager.shutdown().await.unwrap();

        let stored_task = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored_task.status, TaskStatus::Pending);
        let stored_agent = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored_agent.status, AgentStatus::Terminated);
        assert!(!session.is_alive().await);
    }

    #[tokio::test]
    async fn test_probe_liveness() {
        let f = fixture(OrchestratorConfig::default()).await;
        let task = claimed_task(&f, "heartbeat check").await;
        let session = MockSession::new("beating");
        f.provisioner.queue(session.clone());
        let agent = f.manager.spawn(&task).await.unwrap();

        assert!(f.manager.probe_liveness(&agent).await);

        session.set_last_output_at(Some(Utc::now() - Duration::seconds(3600)));
        assert!(!f.manager.probe_liveness(&agent).await);

        session.set_alive(false);
        assert!(!f.manager.probe_liveness(&agent).await);
    }
}
