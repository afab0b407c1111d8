use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use uuid::Uuid;

/// The work brief handed to a freshly launched session: phase instructions,
/// the task itself, and whatever context the retrieval service offered.
#[derive(Debug, Clone)]
pub struct WorkBrief {
    pub phase_name: String,
    pub phase_instructions: String,
    pub task_description: String,
    pub context_snippets: Vec<String>,
}

impl WorkBrief {
    pub fn render(&self) -> String {
        let mut brief = format!(
            "# Phase: {}\n\n{}\n\n# Task\n\n{}\n",
            self.phase_name, self.phase_instructions, self.task_description
        );
        if !self.context_snippets.is_empty() {
            brief.push_str("\n# Context\n\n");
            for snippet in &self.context_snippets {
                brief.push_str(&format!("- {}\n", snippet));
            }
        }
        brief
    }
}

/// A live external interactive session bound to exactly one agent.
/// Injection is one-way, fire-and-forget; output reads are best-effort.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;
    async fn is_alive(&self) -> bool;
    async fn inject_message(&self, text: &str) -> Result<()>;
    async fn read_recent_output(&self, max_lines: usize) -> Result<Vec<String>>;
    /// When the session last wrote to stdout, if it ever has.
    async fn last_output_at(&self) -> Option<DateTime<Utc>>;
    async fn terminate(&self) -> Result<()>;
}

/// External collaborator that turns a workspace plus a work brief into a
/// live session.
#[async_trait]
pub trait SessionProvisioner: Send + Sync {
    async fn launch(&self, workspace: &Path, brief: &WorkBrief) -> Result<Arc<dyn Session>>;
}

/// All live sessions, keyed by session id. Shared between the lifecycle
/// manager (which owns spawn/teardown) and the coherence monitor (which only
/// injects steering and reads output).
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<dyn Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<dyn Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.keys().cloned().collect()
    }
}

/// Session backed by a local child process rooted at the workspace. The
/// brief goes in over stdin at launch; stdout lines land in a bounded ring
/// buffer so a chatty worker cannot grow memory without bound.
pub struct ProcessSession {
    id: String,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    output: Arc<Mutex<VecDeque<String>>>,
    last_output: Arc<Mutex<Option<DateTime<Utc>>>>,
}

const OUTPUT_RING_CAPACITY: usize = 1000;

impl ProcessSession {
    pub async fn launch(
        program: &str,
        args: &[String],
        workspace: &Path,
        brief: &WorkBrief,
    ) -> Result<Arc<Self>> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("session stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("session stdout not captured"))?;

        stdin.write_all(brief.render().as_bytes()).await?;
        stdin.write_all(b"\n").await?;

        let output = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_RING_CAPACITY)));
        let last_output = Arc::new(Mutex::new(None));

        let reader_output = output.clone();
        let reader_last = last_output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = reader_output.lock().unwrap();
                if buf.len() == OUTPUT_RING_CAPACITY {
                    buf.pop_front();
                }
                buf.push_back(line);
                *reader_last.lock().unwrap() = Some(Utc::now());
            }
        });

        Ok(Arc::new(Self {
            id: format!("proc-{}", Uuid::new_v4()),
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            output,
            last_output,
        }))
    }
}

#[async_trait]
impl Session for ProcessSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn inject_message(&self, text: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let handle = stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("session stdin closed"))?;
        handle.write_all(text.as_bytes()).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await?;
        Ok(())
    }

    async fn read_recent_output(&self, max_lines: usize) -> Result<Vec<String>> {
        let buf = self.output.lock().unwrap();
        let skip = buf.len().saturating_sub(max_lines);
        Ok(buf.iter().skip(skip).cloned().collect())
    }

    async fn last_output_at(&self) -> Option<DateTime<Utc>> {
        *self.last_output.lock().unwrap()
    }

    async fn terminate(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(None)) {
            child.start_kill()?;
        }
        Ok(())
    }
}

/// Launches one [`ProcessSession`] per spawn, all with the same worker
/// command.
pub struct ProcessSessionProvisioner {
    program: String,
    args: Vec<String>,
}

impl ProcessSessionProvisioner {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl SessionProvisioner for ProcessSessionProvisioner {
    async fn launch(&self, workspace: &Path, brief: &WorkBrief) -> Result<Arc<dyn Session>> {
        let session = ProcessSession::launch(&self.program, &self.args, workspace, brief).await?;
        Ok(session)
    }
}

// Mock session for testing: scripted output, recorded injections.
pub struct MockSession {
    id: String,
    alive: Arc<Mutex<bool>>,
    output: Arc<Mutex<Vec<String>>>,
    last_output: Arc<Mutex<Option<DateTime<Utc>>>>,
    pub injected: Arc<Mutex<Vec<String>>>,
    pub terminations: Arc<Mutex<u32>>,
}

impl MockSession {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            alive: Arc::new(Mutex::new(true)),
            output: Arc::new(Mutex::new(Vec::new())),
            last_output: Arc::new(Mutex::new(Some(Utc::now()))),
            injected: Arc::new(Mutex::new(Vec::new())),
            terminations: Arc::new(Mutex::new(0)),
        })
    }

    pub fn push_output(&self, line: impl Into<String>) {
        self.output.lock().unwrap().push(line.into());
        *self.last_output.lock().unwrap() = Some(Utc::now());
    }

    pub fn set_alive(&self, alive: bool) {
        *self.alive.lock().unwrap() = alive;
    }

    pub fn set_last_output_at(&self, at: Option<DateTime<Utc>>) {
        *self.last_output.lock().unwrap() = at;
    }

    pub fn injected_messages(&self) -> Vec<String> {
        self.injected.lock().unwrap().clone()
    }

    pub fn termination_count(&self) -> u32 {
        *self.terminations.lock().unwrap()
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap()
    }

    async fn inject_message(&self, text: &str) -> Result<()> {
        self.injected.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn read_recent_output(&self, max_lines: usize) -> Result<Vec<String>> {
        let output = self.output.lock().unwrap();
        let skip = output.len().saturating_sub(max_lines);
        Ok(output[skip..].to_vec())
    }

    async fn last_output_at(&self) -> Option<DateTime<Utc>> {
        *self.last_output.lock().unwrap()
    }

    async fn terminate(&self) -> Result<()> {
        *self.alive.lock().unwrap() = false;
        *self.terminations.lock().unwrap() += 1;
        Ok(())
    }
}

/// Mock provisioner handing out pre-seeded sessions, or fresh ones by default.
#[derive(Default)]
pub struct MockSessionProvisioner {
    queued: Mutex<VecDeque<Arc<MockSession>>>,
    pub fail_next: Mutex<bool>,
}

impl MockSessionProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, session: Arc<MockSession>) {
        self.queued.lock().unwrap().push_back(session);
    }

    pub fn fail_next_launch(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl SessionProvisioner for MockSessionProvisioner {
    async fn launch(&self, _workspace: &Path, _brief: &WorkBrief) -> Result<Arc<dyn Session>> {
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            anyhow::bail!("simulated launch failure");
        }
        let session = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockSession::new(format!("mock-{}", Uuid::new_v4())));
        Ok(session)
    }
}
