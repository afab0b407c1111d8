use serde::{Deserialize, Serialize};

use super::{PhaseId, WorkflowId, WorkflowState};

/// Static definition of a kind of work. Immutable once a workflow starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default = "PhaseId::new_v4")]
    pub id: PhaseId,
    /// Position in the workflow; earlier phases schedule first on ties.
    pub ordinal: u32,
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub completion_criteria: String,
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub state: WorkflowState,
    pub phases: Vec<Phase>,
}

impl Workflow {
    pub fn new(name: String, mut phases: Vec<Phase>) -> Self {
        phases.sort_by_key(|p| p.ordinal);
        Self {
            id: WorkflowId::new_v4(),
            name,
            state: WorkflowState::Running,
            phases,
        }
    }

    pub fn phase(&self, id: PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }
}
