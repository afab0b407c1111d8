use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use overseer::lifecycle::{LocalWorkspaces, ProcessSessionProvisioner, SessionProvisioner};
use overseer::monitor::{EscalationPolicy, ReviewEscalation, ThresholdEscalation};
use overseer::providers::{
    AnthropicOracle, CoherenceOracle, ContextRetriever, HttpRetriever, MockOracle, NullRetriever,
};
use overseer::storage::{InMemoryStore, PostgresStorage, Storage};
use overseer::types::{Phase, Priority, TaskDraft, TaskStatus, Workflow};
use overseer::{Config, Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "overseer")]
#[command(about = "Autonomous agent orchestration over a self-extending task graph", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long, help = "YAML workflow definition (phases and seed tasks)")]
        workflow: PathBuf,
        #[arg(long, help = "TOML tunables; defaults apply when omitted")]
        config: Option<PathBuf>,
        #[arg(long, help = "Command that starts a worker session")]
        agent_cmd: String,
        #[arg(long = "agent-arg", help = "Argument for the worker command, repeatable")]
        agent_args: Vec<String>,
        #[arg(long, help = "Directory new workspaces are copied from")]
        base_revision: Option<PathBuf>,
        #[arg(long, help = "Route exhausted agents to human review instead of failing")]
        review: bool,
    },
}

/// On-disk workflow shape. Phases are listed in execution order; seed tasks
/// reference a phase by its ordinal.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    phases: Vec<Phase>,
    #[serde(default)]
    tasks: Vec<SeedTask>,
}

#[derive(Debug, Deserialize)]
struct SeedTask {
    description: String,
    phase: u32,
    #[serde(default)]
    priority: Priority,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workflow,
            config,
            agent_cmd,
            agent_args,
            base_revision,
            review,
        } => {
            run(
                workflow,
                config,
                agent_cmd,
                agent_args,
                base_revision,
                review,
            )
            .await?
        }
    }

    Ok(())
}

async fn run(
    workflow_path: PathBuf,
    config_path: Option<PathBuf>,
    agent_cmd: String,
    agent_args: Vec<String>,
    base_revision: Option<PathBuf>,
    review: bool,
) -> Result<()> {
    let env = Config::from_env();
    let config = match config_path {
        Some(path) => OrchestratorConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    let raw = std::fs::read_to_string(&workflow_path)
        .with_context(|| format!("reading workflow from {}", workflow_path.display()))?;
    let file: WorkflowFile = serde_yaml::from_str(&raw).context("parsing workflow YAML")?;
    let workflow = Workflow::new(file.name.clone(), file.phases.clone());

    let store: Arc<dyn Storage> = match env.database_url {
        Some(url) => {
            let storage = PostgresStorage::new(&url).await?;
            storage.run_migrations().await?;
            Arc::new(storage)
        }
        None => {
            log::warn!("no DATABASE_URL set, running on the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let oracle: Arc<dyn CoherenceOracle> = match env.anthropic_api_key {
        Some(key) => Arc::new(AnthropicOracle::new(key)),
        None => {
            log::warn!("no ANTHROPIC_API_KEY set, coherence scoring is stubbed");
            Arc::new(MockOracle::with_score(1.0))
        }
    };

    let retriever: Arc<dyn ContextRetriever> = match env.retrieval_url {
        Some(url) => Arc::new(HttpRetriever::new(url)),
        None => Arc::new(NullRetriever),
    };

    let escalation: Arc<dyn EscalationPolicy> = if review {
        Arc::new(ReviewEscalation)
    } else {
        Arc::new(ThresholdEscalation)
    };

    let provisioner: Arc<dyn SessionProvisioner> =
        Arc::new(ProcessSessionProvisioner::new(agent_cmd, agent_args));
    let workspaces = Arc::new(LocalWorkspaces::new(config.workspace_root.clone()));

    let orchestrator = Orchestrator::new(
        store,
        provisioner,
        workspaces,
        retriever,
        oracle,
        escalation,
        config,
        workflow.clone(),
        base_revision,
    )
    .await?;

    let scheduler = orchestrator.scheduler();
    for seed in file.tasks {
        let phase = workflow
            .phases
            .iter()
            .find(|p| p.ordinal == seed.phase)
            .with_context(|| format!("seed task references unknown phase {}", seed.phase))?;
        let task_id = scheduler
            .enqueue(TaskDraft {
                description: seed.description,
                phase_id: phase.id,
                priority: seed.priority,
                depends_on: vec![],
                origin_agent: None,
            })
            .await?;
        log::info!("seeded task {} into phase '{}'", task_id, phase.name);
    }

    println!("Starting workflow {} ({})", workflow.name, workflow.id);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    orchestrator.run().await?;

    let tasks = orchestrator.store().list_tasks().await?;
    let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count();
    println!("Workflow {} stopped", workflow.id);
    println!(
        "Tasks: {} total, {} done, {} failed",
        tasks.len(),
        done,
        failed
    );

    Ok(())
}
