//! Git plumbing for run workspaces.
//!
//! Clone, base-branch resolution, work-branch creation, patch
//! application, and diff extraction. Every invocation goes through
//! `Command::output()` so both pipes are fully drained before the child
//! is reaped.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Clone `url` into `dest`, creating parent directories as needed.
pub fn clone_repo(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let output = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git clone {}: {}",
            url,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo)
        .output()?;
    Ok(output.status.success())
}

/// Resolve the base branch for a freshly cloned repo.
///
/// Preference order: caller-supplied, then `main`, then `master`, then
/// whatever HEAD currently points at.
pub fn resolve_base_branch(repo: &Path, preferred: Option<&str>) -> Result<String> {
    if let Some(branch) = preferred.filter(|b| !b.is_empty()) {
        return Ok(branch.to_string());
    }
    if branch_exists(repo, "main")? {
        return Ok("main".to_string());
    }
    if branch_exists(repo, "master")? {
        return Ok("master".to_string());
    }
    let head = run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(head.trim().to_string())
}

/// Create and check out the work branch from `base`.
pub fn create_work_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    run_git(repo, &["checkout", "-b", branch, base])?;
    Ok(())
}

/// Apply a unified diff in the repository root.
pub fn apply_patch(repo: &Path, diff: &str) -> Result<()> {
    let mut child = Command::new("git")
        .args(["apply", "--whitespace=nowarn", "--recount"])
        .current_dir(repo)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(diff.as_bytes())?;
    }
    // wait_with_output drains both pipes before reaping the child.
    let output = child.wait_with_output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git apply: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Merged diff for the given paths. Untracked files are included via an
/// intent-to-add so fresh writes show up in the output.
pub fn diff(repo: &Path, files: &[String]) -> Result<String> {
    if files.is_empty() {
        return Ok(String::new());
    }

    for file in files {
        if repo.join(file).exists() {
            // Ignore failures here; the path may already be tracked.
            let _ = Command::new("git")
                .args(["add", "--intent-to-add", "--", file])
                .current_dir(repo)
                .output()?;
        }
    }

    let mut args = vec!["diff", "--"];
    args.extend(files.iter().map(String::as_str));
    run_git(repo, &args)
}

/// Paths touched by a unified diff, in first-seen order.
pub fn changed_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("diff --git a/") else {
            continue;
        };
        let Some((_, new)) = rest.split_once(" b/") else {
            continue;
        };
        let path = new.to_string();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Create a branch-safe slug from a task prompt (lowercase, alphanumeric,
/// hyphens, capped length).
pub fn slugify(name: &str) -> String {
    let slug = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    match slug.char_indices().nth(48) {
        Some((idx, _)) => slug[..idx].trim_end_matches('-').to_string(),
        None => slug,
    }
}
