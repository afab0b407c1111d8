use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::TaskId;

/// External collaborator that provisions isolated filesystem workspaces.
/// No two live agents may ever hold overlapping write access to the same
/// path, so every provision call yields a fresh, uniquely-named directory.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn provision(&self, base_revision: Option<&Path>, task_id: TaskId) -> Result<PathBuf>;
    async fn release(&self, workspace: &Path) -> Result<()>;
}

/// Local-disk provisioner: workspaces live under one root, each seeded by
/// copying the base revision when one is given.
pub struct LocalWorkspaces {
    root: PathBuf,
}

impl LocalWorkspaces {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let target = dst.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                Self::copy_tree(&entry.path(), &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvisioner for LocalWorkspaces {
    async fn provision(&self, base_revision: Option<&Path>, task_id: TaskId) -> Result<PathBuf> {
        // Uuid suffix keeps retries of the same task from colliding.
        let name = format!("task-{}-{}", task_id, &Uuid::new_v4().to_string()[..8]);
        let workspace = self.root.join(name);

        let base = base_revision.map(Path::to_path_buf);
        let target = workspace.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            match base {
                Some(base) if base.is_dir() => Self::copy_tree(&base, &target),
                _ => std::fs::create_dir_all(&target),
            }
        })
        .await?
        .with_context(|| format!("provisioning workspace for task {}", task_id))?;

        Ok(workspace)
    }

    async fn release(&self, workspace: &Path) -> Result<()> {
        // Refuse to remove anything outside our root.
        if !workspace.starts_with(&self.root) {
            anyhow::bail!("refusing to release foreign path: {}", workspace.display());
        }
        if workspace.exists() {
            let path = workspace.to_path_buf();
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(path)).await??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_creates_unique_dirs() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = LocalWorkspaces::new(root.path().to_path_buf());
        let task_id = TaskId::new_v4();

        let a = workspaces.provision(None, task_id).await.unwrap();
        let b = workspaces.provision(None, task_id).await.unwrap();

        assert_ne!(a, b);
        assert!(a.is_dir());
        assert!(b.is_dir());
    }

    #[tokio::test]
    async fn test_provision_copies_base_revision() {
        let root = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("src")).unwrap();
        std::fs::write(base.path().join("src/main.rs"), "fn main() {}").unwrap();

        let workspaces = LocalWorkspaces::new(root.path().to_path_buf());
        let ws = workspaces
            .provision(Some(base.path()), TaskId::new_v4())
            .await
            .unwrap();

        let copied = std::fs::read_to_string(ws.join("src/main.rs")).unwrap();
        assert_eq!(copied, "fn main() {}");
    }

    #[tokio::test]
    async fn test_release_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = LocalWorkspaces::new(root.path().to_path_buf());
        let ws = workspaces.provision(None, TaskId::new_v4()).await.unwrap();
        assert!(ws.exists());

        workspaces.release(&ws).await.unwrap();
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn test_release_refuses_foreign_paths() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = LocalWorkspaces::new(root.path().to_path_buf());
        let foreign = tempfile::tempdir().unwrap();

        assert!(workspaces.release(foreign.path()).await.is_err());
        assert!(foreign.path().exists());
    }
}
