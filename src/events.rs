use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentId, TaskId, TaskStatus};

/// Everything externally observable about a run: status transitions,
/// spawn/teardown, steering, assessments. Consumers (dashboards, log sinks)
/// subscribe via [`EventBus::subscribe`]; the core never blocks on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestrationEvent {
    TaskEnqueued {
        task_id: TaskId,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        agent_id: Option<AgentId>,
    },
    TaskRequeued {
        task_id: TaskId,
        prior: TaskStatus,
    },
    AgentSpawned {
        agent_id: AgentId,
        task_id: TaskId,
        session_id: String,
    },
    AgentTerminated {
        agent_id: AgentId,
        reason: String,
    },
    SteeringInjected {
        agent_id: AgentId,
        score: f32,
    },
    AssessmentRecorded {
        agent_id: AgentId,
        score: f32,
    },
    Escalated {
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
    },
    WorkflowStopped,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget. A send error only means nobody is listening.
    pub fn emit(&self, event: OrchestrationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
