pub mod escalation;

pub use escalation::{EscalationDecision, EscalationPolicy, ReviewEscalation, ThresholdEscalation};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::events::{EventBus, OrchestrationEvent};
use crate::lifecycle::SessionRegistry;
use crate::providers::CoherenceOracle;
use crate::storage::Storage;
use crate::types::{Agent, AgentStatus, CoherenceAssessment, TaskStatus};

/// Watches every working agent on a fixed-interval tick, scores its recent
/// trajectory against the phase goal, and steers or escalates. Synchronizes
/// with the scheduler and lifecycle manager only through the store; steering
/// goes straight into the agent's live session, one-way.
pub struct CoherenceMonitor {
    store: Arc<dyn Storage>,
    sessions: SessionRegistry,
    oracle: Arc<dyn CoherenceOracle>,
    escalation: Arc<dyn EscalationPolicy>,
    config: OrchestratorConfig,
    events: EventBus,
}

impl CoherenceMonitor {
    pub fn new(
        store: Arc<dyn Storage>,
        sessions: SessionRegistry,
        oracle: Arc<dyn CoherenceOracle>,
        escalation: Arc<dyn EscalationPolicy>,
        config: OrchestratorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            sessions,
            oracle,
            escalation,
            config,
            events,
        }
    }

    /// Tick until cancelled. Tick failures are logged and the cadence keeps
    /// going; the monitor only ever produces best-effort side information.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        log::error!("coherence tick failed: {}", e);
                    }
                }
            }
        }
        log::info!("coherence monitor stopped");
    }

    /// One evaluation pass over all working agents, with bounded fan-out so
    /// a single stuck oracle call cannot delay the rest of the tick.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let agents = self.store.list_agents_by_status(AgentStatus::Working).await?;
        let grace = self.config.grace_window_secs as i64;
        let now = Utc::now();

        let candidates: Vec<Agent> = agents
            .into_iter()
            // Silent-beyond-grace agents belong to the orphan sweep, not to
            // the oracle.
            .filter(|a| a.silence_secs(now) < grace)
            .collect();

        let assessed: Vec<bool> = stream::iter(
            candidates
                .into_iter()
                .map(|agent| self.evaluate_agent(agent)),
        )
        .buffer_unordered(self.config.max_concurrent_scores)
        .collect()
        .await;

        Ok(assessed.into_iter().filter(|done| *done).count())
    }

    /// Score one agent. Any collaborator failure skips the agent for this
    /// tick; it gets retried on the next one with no penalty.
    async fn evaluate_agent(&self, agent: Agent) -> bool {
        let Ok(Some(task)) = self.store.get_task(agent.task_id).await else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        let Ok(Some(phase)) = self.store.get_phase(agent.phase_id).await else {
            return false;
        };
        let Some(session) = self.sessions.get(&agent.session_id) else {
            return false;
        };
        let output = match session
            .read_recent_output(self.config.output_window_lines)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                log::warn!("could not read output for agent {}: {}", agent.id, e);
                return false;
            }
        };

        let deadline = Duration::from_secs(self.config.oracle_timeout_secs);
        let assessment = match tokio::time::timeout(
            deadline,
            self.oracle
                .assess(&phase.instructions, &task.description, &output),
        )
        .await
        {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(e)) => {
                log::warn!("oracle call failed for agent {}: {}", agent.id, e);
                return false;
            }
            Err(_) => {
                log::warn!(
                    "oracle timed out for agent {} after {}s",
                    agent.id,
                    self.config.oracle_timeout_secs
                );
                return false;
            }
        };

        let score = assessment.score.clamp(0.0, 1.0);
        let below = score < self.config.coherence_threshold;

        let steering = if below {
            Some(assessment.steering.unwrap_or_else(|| {
                format!(
                    "You appear to have drifted from the goal of phase '{}'. {} Refocus on: {}",
                    phase.name, assessment.rationale, task.description
                )
            }))
        } else {
            None
        };

        let record = CoherenceAssessment {
            agent_id: agent.id,
            task_id: task.id,
            score,
            rationale: assessment.rationale,
            steering: steering.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_assessment(&record).await {
            log::error!("failed to record assessment for agent {}: {}", agent.id, e);
            return false;
        }
        self.events.emit(OrchestrationEvent::AssessmentRecorded {
            agent_id: agent.id,
            score,
        });

        if let Some(message) = steering {
            // One-way, fire-and-forget: a failed injection still counts the
            // steering attempt.
            if let Err(e) = session.inject_message(&message).await {
                log::warn!("steering injection failed for agent {}: {}", agent.id, e);
            }
            let _ = self.store.record_steering(agent.id).await;
            self.events.emit(OrchestrationEvent::SteeringInjected {
                agent_id: agent.id,
                score,
            });

            self.escalate_if_needed(&agent).await;
        } else {
            let _ = self.store.reset_low_streak(agent.id).await;
        }

        true
    }

    /// Read back the fresh counters and apply the escalation policy. All
    /// routing goes through the store: the teardown sweep notices the
    /// terminal task and closes the agent.
    async fn escalate_if_needed(&self, agent: &Agent) {
        let Ok(Some(current)) = self.store.get_agent(agent.id).await else {
            return;
        };
        let decision = self.escalation.evaluate(&current, &self.config);
        let (target, reason) = match decision {
            EscalationDecision::Continue => return,
            EscalationDecision::ForceFail => (
                TaskStatus::Failed,
                format!(
                    "coherence escalation: steered {} times ({} consecutive low ticks)",
                    current.steering_count, current.consecutive_low_ticks
                ),
            ),
            EscalationDecision::HumanReview => (
                TaskStatus::BlockedOnValidation,
                "coherence escalation: routed to human review".to_string(),
            ),
        };

        match self
            .store
            .compare_and_set_task_status(agent.task_id, TaskStatus::InProgress, target)
            .await
        {
            Ok(true) => {
                if target == TaskStatus::Failed {
                    let _ = self.store.set_failure_reason(agent.task_id, &reason).await;
                    let _ = self.store.clear_task_agent(agent.task_id).await;
                }
                log::warn!(
                    "escalated task {} for agent {}: {}",
                    agent.task_id,
                    agent.id,
                    reason
                );
                self.events.emit(OrchestrationEvent::TaskStatusChanged {
                    task_id: agent.task_id,
                    from: TaskStatus::InProgress,
                    to: target,
                    agent_id: Some(agent.id),
                });
                self.events.emit(OrchestrationEvent::Escalated {
                    agent_id: agent.id,
                    task_id: agent.task_id,
                    reason,
                });
            }
            Ok(false) => {
                // The task moved on (worker finished, orphan sweep requeued).
                log::debug!("escalation for task {} lost the race", agent.task_id);
            }
            Err(e) => log::error!("escalation CAS failed for task {}: {}", agent.task_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::MockSession;
    use crate::providers::{Assessment, MockOracle};
    use crate::storage::InMemoryStore;
    use crate::types::{Phase, PhaseId, Priority, Task, TaskDraft, Workflow};

    struct Fixture {
        store: Arc<InMemoryStore>,
        sessions: SessionRegistry,
        phase_id: PhaseId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let phase = Phase {
            id: PhaseId::new_v4(),
            ordinal: 1,
            name: "Implementation".to_string(),
            instructions: "implement the feature".to_string(),
            completion_criteria: String::new(),
            allowed_capabilities: vec![],
        };
        let phase_id = phase.id;
        store
            .create_workflow(&Workflow::new("wf".to_string(), vec![phase]))
            .await
            .unwrap();
        Fixture {
            store,
            sessions: SessionRegistry::new(),
            phase_id,
        }
    }

    fn monitor(f: &Fixture, oracle: Arc<dyn CoherenceOracle>, config: OrchestratorConfig) -> CoherenceMonitor {
        CoherenceMonitor::new(
            f.store.clone(),
            f.sessions.clone(),
            oracle,
            Arc::new(ThresholdEscalation),
            config,
            EventBus::default(),
        )
    }

    async fn working_agent(f: &Fixture, session_id: &str) -> (Task, Agent, Arc<MockSession>) {
        let task = Task::from_draft(TaskDraft {
            description: "add the parser".to_string(),
            phase_id: f.phase_id,
            priority: Priority::Medium,
            depends_on: vec![],
            origin_agent: None,
        });
        f.store.create_task(&task).await.unwrap();
        f.store.claim_task(task.id).await.unwrap();

        let session = MockSession::new(session_id);
        session.push_output("working on it");
        f.sessions.insert(session.clone());

        let agent = Agent::new(
            task.id,
            f.phase_id,
            session_id.to_string(),
            std::path::PathBuf::from("/tmp/ws"),
        );
        f.store.create_agent(&agent).await.unwrap();
        f.store.start_task(task.id, agent.id).await.unwrap();

        (task, agent, session)
    }

    #[tokio::test]
    async fn test_low_score_steers_once() {
        let f = fixture().await;
        let (_task, agent, session) = working_agent(&f, "s1").await;
        let oracle = Arc::new(MockOracle::with_score(0.4));
        let monitor = monitor(&f, oracle, OrchestratorConfig::default());

        let assessed = monitor.tick().await.unwrap();
        assert_eq!(assessed, 1);

        assert_eq!(session.injected_messages().len(), 1);
        let assessments = f.store.assessments_for(agent.id).await.unwrap();
        assert_eq!(assessments.len(), 1);
        assert!((assessments[0].score - 0.4).abs() < 1e-6);
        assert!(assessments[0].steering.is_some());

        let stored = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.steering_count, 1);
    }

    #[tokio::test]
    async fn test_high_score_records_without_steering() {
        let f = fixture().await;
        let (_task, agent, session) = working_agent(&f, "s1").await;
        let oracle = Arc::new(MockOracle::with_score(0.9));
        let monitor = monitor(&f, oracle, OrchestratorConfig::default());

        monitor.tick().await.unwrap();

        assert!(session.injected_messages().is_empty());
        let assessments = f.store.assessments_for(agent.id).await.unwrap();
        assert_eq!(assessments.len(), 1);
        assert!(assessments[0].steering.is_none());
        let stored = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.steering_count, 0);
    }

    #[tokio::test]
    async fn test_recovery_resets_streak() {
        // 0.4 steers; a later 0.9 records an assessment but injects nothing
        // and clears the consecutive counter.
        let f = fixture().await;
        let (_task, agent, session) = working_agent(&f, "s1").await;
        let oracle = Arc::new(MockOracle::with_score(0.9));
        oracle.queue(Assessment {
            score: 0.4,
            rationale: "drifting".to_string(),
            steering: Some("come back".to_string()),
        });
        let monitor = monitor(&f, oracle, OrchestratorConfig::default());

        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();

        assert_eq!(session.injected_messages(), vec!["come back".to_string()]);
        let assessments = f.store.assessments_for(agent.id).await.unwrap();
        assert_eq!(assessments.len(), 2);

        let stored = f.store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.steering_count, 1);
        assert_eq!(stored.consecutive_low_ticks, 0);
    }

    #[tokio::test]
    async fn test_oracle_failure_skips_agent_without_penalty() {
        let f = fixture().await;
        let (_task, agent, session) = working_agent(&f, "s1").await;
        let oracle = Arc::new(MockOracle::with_score(0.2));
        oracle.set_failing(true);
        let monitor = monitor(&f, oracle.clone(), OrchestratorConfig::default());

        let assessed = monitor.tick().await.unwrap();
        assert_eq!(assessed, 0);
        assert!(session.injected_messages().is_empty());
        assert!(f.store.assessments_for(agent.id).await.unwrap().is_empty());

        // Next tick the oracle is back and evaluation resumes.
        oracle.set_failing(false);
        let assessed = monitor.tick().await.unwrap();
        assert_eq!(assessed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_oracle_does_not_block_the_tick() {
        let f = fixture().await;
        let (_task, agent, _session) = working_agent(&f, "s1").await;
        let oracle = Arc::new(MockOracle::with_score(0.9));
        // Stall well past the timeout; the paused clock fast-forwards.
        oracle.set_delay_ms(120_000);
        let mut config = OrchestratorConfig::default();
        config.oracle_timeout_secs = 30;
        let monitor = monitor(&f, oracle, config);

        let assessed = monitor.tick().await.unwrap();
        assert_eq!(assessed, 0);
        assert!(f.store.assessments_for(agent.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_forces_failure() {
        let f = fixture().await;
        let (task, agent, _session) = working_agent(&f, "s1").await;
        // Already at the consecutive cap; one more low tick escalates.
        for _ in 0..2 {
            f.store.record_steering(agent.id).await.unwrap();
        }

        let oracle = Arc::new(MockOracle::with_score(0.3));
        let monitor = monitor(&f, oracle, OrchestratorConfig::default());
        monitor.tick().await.unwrap();

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("escalation"));
    }

    #[tokio::test]
    async fn test_silent_agent_left_to_orphan_sweep() {
        let f = fixture().await;
        let (_task, agent, session) = working_agent(&f, "s1").await;
        let stale = Utc::now() - chrono::Duration::seconds(600);
        f.store.touch_agent_output(agent.id, stale).await.unwrap();
        session.set_last_output_at(Some(stale));

        let oracle = Arc::new(MockOracle::with_score(0.1));
        let monitor = monitor(&f, oracle, OrchestratorConfig::default());
        let assessed = monitor.tick().await.unwrap();

        assert_eq!(assessed, 0);
        assert!(session.injected_messages().is_empty());
    }
}
