use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::errors::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestrationEvent};
use crate::lifecycle::{
    LifecycleManager, SessionProvisioner, SessionRegistry, WorkspaceProvisioner,
};
use crate::monitor::{CoherenceMonitor, EscalationPolicy};
use crate::providers::{CoherenceOracle, ContextRetriever};
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::types::{AgentStatus, TaskStatus, Workflow, WorkflowId, WorkflowState};

/// Top-level wiring. Owns the scheduler, lifecycle manager and coherence
/// monitor and drives them from three loops: dispatch (claim work and spawn
/// agents), sweep (close finished agents, reap orphans) and the monitor tick.
pub struct Orchestrator {
    store: Arc<dyn Storage>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<LifecycleManager>,
    monitor: Arc<CoherenceMonitor>,
    config: OrchestratorConfig,
    events: EventBus,
    cancel: CancellationToken,
    workflow_id: WorkflowId,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        store: Arc<dyn Storage>,
        provisioner: Arc<dyn SessionProvisioner>,
        workspaces: Arc<dyn WorkspaceProvisioner>,
        retriever: Arc<dyn ContextRetriever>,
        oracle: Arc<dyn CoherenceOracle>,
        escalation: Arc<dyn EscalationPolicy>,
        config: OrchestratorConfig,
        workflow: Workflow,
        base_revision: Option<PathBuf>,
    ) -> Result<Self> {
        let workflow_id = workflow.id;
        store.create_workflow(&workflow).await?;

        let events = EventBus::default();
        let sessions = SessionRegistry::new();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            config.clone(),
            events.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            scheduler.clone(),
            sessions.clone(),
            provisioner,
            workspaces,
            retriever,
            config.clone(),
            events.clone(),
            base_revision,
        ));
        let monitor = Arc::new(CoherenceMonitor::new(
            store.clone(),
            sessions,
            oracle,
            escalation,
            config.clone(),
            events.clone(),
        ));

        Ok(Self {
            store,
            scheduler,
            lifecycle,
            monitor,
            config,
            events,
            cancel: CancellationToken::new(),
            workflow_id,
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn store(&self) -> Arc<dyn Storage> {
        self.store.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until the cancellation token fires, then drain. Spawns the sweep
    /// and monitor loops and drives dispatch on the current task.
    pub async fn run(&self) -> Result<()> {
        let monitor = self.monitor.clone();
        let monitor_cancel = self.cancel.child_token();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        let sweep_cancel = self.cancel.child_token();
        let sweeper = SweepLoop {
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            lifecycle: self.lifecycle.clone(),
            config: self.config.clone(),
        };
        let sweep_handle = tokio::spawn(async move {
            sweeper.run(sweep_cancel).await;
        });

        self.dispatch_loop().await;

        let _ = tokio::join!(monitor_handle, sweep_handle);
        self.drain().await
    }

    /// Wake on the scheduler's notifier or a poll timer, whichever comes
    /// first. The poll covers writes that bypass the notifier, like a worker
    /// enqueuing through a second store handle.
    async fn dispatch_loop(&self) {
        let notify = self.scheduler.notifier();
        let poll = Duration::from_secs(self.config.dispatch_poll_secs);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            if let Err(e) = self.dispatch_once().await {
                log::error!("dispatch pass failed: {}", e);
            }
        }
        log::info!("dispatch loop stopped");
    }

    /// Claim every runnable task within capacity and spawn an agent for each.
    /// A failed spawn puts the task straight back in the queue.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let claimed = self
            .scheduler
            .select_next(self.config.max_concurrent_tasks)
            .await?;
        let mut spawned = 0;
        for task in &claimed {
            match self.lifecycle.spawn(task).await {
                Ok(_) => spawned += 1,
                Err(e) => {
                    log::warn!("spawn failed for task {}: {}", task.id, e);
                    if let Err(requeue_err) = self.scheduler.requeue(task.id).await {
                        log::error!(
                            "could not requeue task {} after failed spawn: {}",
                            task.id,
                            requeue_err
                        );
                    }
                }
            }
        }
        Ok(spawned)
    }

    /// Stop the loops, drain in-flight agents back to the queue, and mark the
    /// workflow stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.drain().await
    }

    async fn drain(&self) -> Result<()> {
        self.lifecycle.shutdown().await?;
        self.store
            .set_workflow_state(self.workflow_id, WorkflowState::Stopped)
            .await?;
        self.events.emit(OrchestrationEvent::WorkflowStopped);
        log::info!("orchestrator stopped");
        Ok(())
    }
}

/// Periodic reconciliation: close agents whose tasks reached a terminal
/// status, then reap orphans. Runs independently of dispatch so a wedged
/// spawn cannot starve cleanup.
struct SweepLoop {
    store: Arc<dyn Storage>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<LifecycleManager>,
    config: OrchestratorConfig,
}

impl SweepLoop {
    async fn run(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        log::error!("sweep failed: {}", e);
                    }
                }
            }
        }
        log::info!("sweep loop stopped");
    }

    async fn sweep(&self) -> Result<()> {
        let closed = self.close_finished_agents().await?;
        let reaped = self.lifecycle.reconcile_orphans().await?;
        if closed > 0 || !reaped.is_empty() {
            log::info!(
                "sweep closed {} finished agents, reaped {} orphans",
                closed,
                reaped.len()
            );
            // Terminal tasks and reaped orphans both free slots.
            self.scheduler.notifier().notify_one();
        }
        Ok(())
    }

    /// Agents whose task is already terminal have nothing left to do. The
    /// monitor's escalations land here too, since it only writes the store.
    async fn close_finished_agents(&self) -> Result<usize> {
        let mut closed = 0;
        for agent in self
            .store
            .list_agents_by_status(AgentStatus::Working)
            .await?
        {
            let done = match self.store.get_task(agent.task_id).await? {
                Some(task) => task.status.is_terminal(),
                None => true,
            };
            if !done {
                continue;
            }
            let retain = self.config.retain_failed_workspaces
                && matches!(
                    self.store.get_task(agent.task_id).await?.map(|t| t.status),
                    Some(TaskStatus::Failed)
                );
            match self.lifecycle.teardown(agent.id, "task finished", retain).await {
                Ok(()) => closed += 1,
                Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => log::warn!("teardown of agent {} failed: {}", agent.id, e),
            }
        }
        Ok(closed)
    }
}
