pub mod config;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::{Config, OrchestratorConfig};
pub use errors::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use types::*;
