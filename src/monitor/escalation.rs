use crate::config::OrchestratorConfig;
use crate::types::Agent;

/// What to do with an agent that keeps scoring low. Steering forever is not
/// an option; at some point the task is routed to forced failure or to a
/// human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    Continue,
    ForceFail,
    HumanReview,
}

pub trait EscalationPolicy: Send + Sync {
    fn evaluate(&self, agent: &Agent, config: &OrchestratorConfig) -> EscalationDecision;
}

/// Default policy: fail the task once the agent has been steered on too many
/// consecutive ticks, or too many times overall.
pub struct ThresholdEscalation;

impl EscalationPolicy for ThresholdEscalation {
    fn evaluate(&self, agent: &Agent, config: &OrchestratorConfig) -> EscalationDecision {
        if agent.consecutive_low_ticks >= config.max_consecutive_low_ticks
            || agent.steering_count >= config.max_steering_count
        {
            EscalationDecision::ForceFail
        } else {
            EscalationDecision::Continue
        }
    }
}

/// Routes repeat offenders to validation instead of failing them outright.
pub struct ReviewEscalation;

impl EscalationPolicy for ReviewEscalation {
    fn evaluate(&self, agent: &Agent, config: &OrchestratorConfig) -> EscalationDecision {
        if agent.consecutive_low_ticks >= config.max_consecutive_low_ticks {
            EscalationDecision::HumanReview
        } else {
            EscalationDecision::Continue
        }
    }
}
