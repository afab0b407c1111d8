use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{AgentId, AgentStatus, PhaseId, TaskId};

/// An ephemeral worker bound 1:1 to one live external session. Created when
/// the lifecycle manager spawns a session for a dequeued task; destroyed on
/// task completion, explicit stop, or orphan reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub status: AgentStatus,
    pub task_id: TaskId,
    pub phase_id: PhaseId,
    pub session_id: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Heartbeat: last time the bound session produced observable output.
    pub last_output_at: DateTime<Utc>,
    pub steering_count: u32,
    pub consecutive_low_ticks: u32,
}

impl Agent {
    pub fn new(task_id: TaskId, phase_id: PhaseId, session_id: String, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new_v4(),
            status: AgentStatus::Working,
            task_id,
            phase_id,
            session_id,
            workspace,
            created_at: now,
            last_output_at: now,
            steering_count: 0,
            consecutive_low_ticks: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != AgentStatus::Terminated
    }

    /// Seconds since the session last produced output.
    pub fn silence_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_output_at).num_seconds()
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_agent_is_working() {
        let agent = Agent::new(
            TaskId::new_v4(),
            PhaseId::new_v4(),
            "sess-1".to_string(),
            PathBuf::from("/tmp/ws"),
        );
        assert_eq!(agent.status, AgentStatus::Working);
        assert!(agent.is_live());
        assert_eq!(agent.steering_count, 0);
    }

    #[test]
    fn test_silence_secs() {
        let mut agent = Agent::new(
            TaskId::new_v4(),
            PhaseId::new_v4(),
            "sess-1".to_string(),
            PathBuf::from("/tmp/ws"),
        );
        let now = Utc::now();
        agent.last_output_at = now - Duration::seconds(90);
        assert!(agent.silence_secs(now) >= 90);
    }
}
