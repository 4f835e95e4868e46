//! Status rendering for the CLI.
//!
//! One-shot (or `--watch`-refreshed) views assembled from the handoffs
//! under `<root>/runs` plus the queue counters.

use crate::queue::{QueueError, QueueStore};
use conveyor_core::handoff::HandoffError;
use conveyor_core::{Config, Handoff, Id};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, StatusError>;

/// Detailed view of a single run.
pub async fn render_run(config: &Config, store: &QueueStore, run_id: &Id) -> Result<String> {
    let run_dir = config.run_dir(run_id);
    let handoff = match Handoff::load(&run_dir) {
        Ok(h) => h,
        Err(HandoffError::NotFound(_)) => {
            return Err(StatusError::RunNotFound(run_id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut out = String::new();
    let _ = writeln!(out, "run      {run_id}");
    let _ = writeln!(out, "task     {}", truncate(&handoff.task.prompt, 72));
    let _ = writeln!(
        out,
        "state    {} / {}  (iteration {}/{})",
        handoff.state.phase.as_str(),
        handoff.state.status.as_str(),
        handoff.state.iteration,
        handoff.state.max_iterations
    );
    if !handoff.run.repo.branch.is_empty() {
        let _ = writeln!(
            out,
            "branch   {} (base {})",
            handoff.run.repo.branch, handoff.run.repo.base_branch
        );
    }

    if let Some(last) = handoff.state.history.last() {
        let _ = writeln!(
            out,
            "last     {} {} at {} ({})",
            last.phase.as_str(),
            last.status.as_str(),
            last.ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if last.artifact.is_empty() {
                "-"
            } else {
                last.artifact.as_str()
            }
        );
    }
    if let Some(note) = handoff.notes.last() {
        let _ = writeln!(out, "note     {}", truncate(note, 72));
    }

    let present: Vec<&str> = handoff
        .artifacts
        .values()
        .map(String::as_str)
        .filter(|name| run_dir.join(name).exists())
        .collect();
    if !present.is_empty() {
        let _ = writeln!(out, "files    {}", present.join(", "));
    }

    let jobs = store.list_jobs(run_id).await?;
    for job in jobs {
        let _ = writeln!(
            out,
            "job #{:<4} {:<9} {:<11} attempt {}{}",
            job.id,
            job.phase.as_str(),
            job.status.as_str(),
            job.attempt,
            job.last_error
                .as_deref()
                .map(|e| format!("  ({})", truncate(e, 48)))
                .unwrap_or_default()
        );
    }

    Ok(out)
}

/// Listing of every run under the state root plus queue counters.
pub async fn render_all(config: &Config, store: &QueueStore) -> Result<String> {
    let mut out = String::new();

    let runs_dir = config.runs_dir();
    let mut entries: Vec<String> = Vec::new();
    if runs_dir.exists() {
        for entry in std::fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                entries.push(entry.file_name().to_string_lossy().to_string());
            }
        }
    }
    // UUIDv7 run ids sort chronologically.
    entries.sort();

    if entries.is_empty() {
        let _ = writeln!(out, "no runs");
    }
    for name in entries {
        let run_dir = runs_dir.join(&name);
        match Handoff::load(&run_dir) {
            Ok(h) => {
                let _ = writeln!(
                    out,
                    "{name}  {:<9} {:<11} {}",
                    h.state.phase.as_str(),
                    h.state.status.as_str(),
                    truncate(&h.task.prompt, 48)
                );
            }
            Err(e) => {
                let _ = writeln!(out, "{name}  <unreadable handoff: {e}>");
            }
        }
    }

    let stats = store.stats().await?;
    let _ = writeln!(
        out,
        "queue    {} queued, {} in progress, {} lease(s)",
        stats.queued, stats.in_progress, stats.lease_count
    );

    Ok(out)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
