//! Workspace provisioning.
//!
//! The plan phase needs a cloned repository on a fresh work branch; the
//! pr phase removes it unless the run keeps its workspace. Both sit
//! behind a trait so tests can substitute local fixtures for network
//! clones.

use crate::git;
use async_trait::async_trait;
use conveyor_core::Id;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository url is empty")]
    EmptyUrl,
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Coordinates of a prepared workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub root: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Clone the repository for a run, resolve its base branch, and
    /// check out the work branch.
    async fn prepare(
        &self,
        run_id: &Id,
        url: &str,
        base_branch: Option<&str>,
        task_prompt: &str,
    ) -> Result<WorkspaceInfo>;

    /// Remove a workspace directory after the pipeline finishes.
    async fn remove(&self, root: &Path) -> Result<()>;
}

/// Git-backed provider: workspaces live under `<root>/workspaces/<run_id>`
/// and work branches are named `<prefix>/<slug(task)>`.
pub struct GitWorkspaces {
    workspaces_root: PathBuf,
    branch_prefix: String,
}

impl GitWorkspaces {
    pub fn new(workspaces_root: PathBuf, branch_prefix: String) -> Self {
        Self {
            workspaces_root,
            branch_prefix,
        }
    }

    fn work_branch(&self, task_prompt: &str) -> String {
        let slug = git::slugify(task_prompt);
        if slug.is_empty() {
            format!("{}/run", self.branch_prefix)
        } else {
            format!("{}/{}", self.branch_prefix, slug)
        }
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaces {
    async fn prepare(
        &self,
        run_id: &Id,
        url: &str,
        base_branch: Option<&str>,
        task_prompt: &str,
    ) -> Result<WorkspaceInfo> {
        if url.is_empty() {
            return Err(WorkspaceError::EmptyUrl);
        }

        let dest = self.workspaces_root.join(run_id.as_ref());
        // A retried plan job may leave a half-prepared clone behind.
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        git::clone_repo(url, &dest)?;
        let base = git::resolve_base_branch(&dest, base_branch)?;
        let branch = self.work_branch(task_prompt);
        git::create_work_branch(&dest, &branch, &base)?;

        Ok(WorkspaceInfo {
            root: dest,
            branch,
            base_branch: base,
        })
    }

    async fn remove(&self, root: &Path) -> Result<()> {
        if root.exists() {
            tokio::fs::remove_dir_all(root).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_origin(dir: &Path) {
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.join("src.rs"), "fn main() {}\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    #[tokio::test]
    async fn prepare_clones_and_branches() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path());
        let state = TempDir::new().unwrap();

        let provider = GitWorkspaces::new(
            state.path().join("workspaces"),
            "conveyor".to_string(),
        );
        let run_id = Id::new();
        let info = provider
            .prepare(
                &run_id,
                origin.path().to_str().unwrap(),
                None,
                "Add a flag",
            )
            .await
            .unwrap();

        assert_eq!(info.base_branch, "main");
        assert_eq!(info.branch, "conveyor/add-a-flag");
        assert!(info.root.join("src.rs").exists());
        assert!(info.root.ends_with(run_id.as_ref()));
    }

    #[tokio::test]
    async fn prepare_rejects_empty_url() {
        let state = TempDir::new().unwrap();
        let provider =
            GitWorkspaces::new(state.path().join("workspaces"), "conveyor".to_string());
        let result = provider.prepare(&Id::new(), "", None, "x").await;
        assert!(matches!(result, Err(WorkspaceError::EmptyUrl)));
    }

    #[tokio::test]
    async fn remove_deletes_workspace_and_is_idempotent() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path());
        let state = TempDir::new().unwrap();

        let provider =
            GitWorkspaces::new(state.path().join("workspaces"), "conveyor".to_string());
        let info = provider
            .prepare(&Id::new(), origin.path().to_str().unwrap(), None, "x")
            .await
            .unwrap();

        provider.remove(&info.root).await.unwrap();
        assert!(!info.root.exists());
        provider.remove(&info.root).await.unwrap();
    }
}
