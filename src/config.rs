use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Credentials and endpoints pulled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub database_url: Option<String>,
    pub retrieval_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            retrieval_url: std::env::var("RETRIEVAL_URL").ok(),
        }
    }
}

/// Tunables for the orchestration core. All durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global ceiling on simultaneously claimed/running tasks.
    pub max_concurrent_tasks: usize,
    /// Optional per-phase ceiling; `None` means only the global ceiling applies.
    pub per_phase_limit: Option<usize>,

    /// Coherence monitor cadence.
    pub tick_interval_secs: u64,
    /// Scores below this trigger a steering injection.
    pub coherence_threshold: f32,
    /// Bounded fan-out for per-agent oracle calls within one tick.
    pub max_concurrent_scores: usize,
    pub oracle_timeout_secs: u64,
    /// Trailing window of session output sent to the oracle.
    pub output_window_lines: usize,

    /// Silence longer than this marks an agent as an orphan candidate. A
    /// tunable false-positive/false-negative tradeoff, not a hard bound:
    /// too short and slow-starting agents get reaped, too long and dead
    /// sessions linger.
    pub grace_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub dispatch_poll_secs: u64,

    /// Consecutive low-score ticks before escalation.
    pub max_consecutive_low_ticks: u32,
    /// Lifetime steering cap before escalation.
    pub max_steering_count: u32,

    pub workspace_root: PathBuf,
    /// Keep a torn-down agent's workspace around for diagnosis.
    pub retain_failed_workspaces: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            per_phase_limit: None,
            tick_interval_secs: 60,
            coherence_threshold: 0.7,
            max_concurrent_scores: 5,
            oracle_timeout_secs: 30,
            output_window_lines: 100,
            grace_window_secs: 180,
            sweep_interval_secs: 30,
            dispatch_poll_secs: 5,
            max_consecutive_low_ticks: 3,
            max_steering_count: 10,
            workspace_root: PathBuf::from("/tmp/overseer/workspaces"),
            retain_failed_workspaces: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.tick_interval_secs, 60);
        assert!((config.coherence_threshold - 0.7).abs() < f32::EPSILON);
        assert!(config.grace_window_secs > 0);
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.toml");
        std::fs::write(
            &path,
            r#"
max_concurrent_tasks = 8
tick_interval_secs = 15
coherence_threshold = 0.5
max_concurrent_scores = 3
oracle_timeout_secs = 10
output_window_lines = 50
grace_window_secs = 60
sweep_interval_secs = 10
dispatch_poll_secs = 2
max_consecutive_low_ticks = 2
max_steering_count = 5
workspace_root = "/tmp/ws"
retain_failed_workspaces = true
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.tick_interval_secs, 15);
        assert!(config.retain_failed_workspaces);
    }
}
