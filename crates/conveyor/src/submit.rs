//! Run submission and cancellation.
//!
//! `submit` creates the run directory, writes `task.json` and the
//! queued handoff, and enqueues the first `plan` job. `cancel` marks
//! every live job cancelled, force-releases the lease, and writes the
//! cancelled handoff; an in-flight worker observes it at its next
//! handoff read.

use crate::queue::{QueueError, QueueStore};
use conveyor_core::artifacts::canonical_artifacts;
use conveyor_core::handoff::{Handoff, HandoffError, HandoffUpdate, NextStep, QueuedParams};
use conveyor_core::{Agent, Config, Id, Phase, RunStatus};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid task json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SubmitError>;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task: String,
    pub repo_url: String,
    pub keep_workspace: bool,
    pub base_branch: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskFile<'a> {
    id: &'a Id,
    prompt: &'a str,
    mode: &'a str,
}

/// Create the run directory and its initial documents without queueing
/// anything. Shared by `submit` and the manual single-phase commands.
pub fn create_run(config: &Config, request: &SubmitRequest) -> Result<Id> {
    let run_id = Id::new();
    let run_dir = config.run_dir(&run_id);
    std::fs::create_dir_all(&run_dir)?;

    let task = TaskFile {
        id: &run_id,
        prompt: &request.task,
        mode: "pipeline",
    };
    std::fs::write(
        run_dir.join("task.json"),
        serde_json::to_vec_pretty(&task)?,
    )?;

    let handoff = Handoff::queued(QueuedParams {
        run_id: run_id.clone(),
        prompt: request.task.clone(),
        repo_url: request.repo_url.clone(),
        base_branch: request.base_branch.clone(),
        keep_workspace: request.keep_workspace,
        max_iterations: config.max_review_retries,
        artifacts: canonical_artifacts(),
        next: NextStep::new(Agent::Planner),
    });
    handoff.save(&run_dir)?;

    Ok(run_id)
}

/// Submit a run: write its documents, enqueue `plan`, and warn when no
/// worker appears to be draining the queue.
pub async fn submit(config: &Config, store: &QueueStore, request: SubmitRequest) -> Result<Id> {
    let run_id = create_run(config, &request)?;
    store.enqueue(&run_id, Phase::Plan).await?;
    info!(%run_id, repo = %request.repo_url, "run submitted");

    let stats = store.stats().await?;
    if stats.queued > 0 && stats.in_progress == 0 && stats.lease_count == 0 {
        warn!(
            queued = stats.queued,
            "no active worker detected; start one with `conveyor worker`"
        );
    }

    Ok(run_id)
}

/// Cancel a run. Idempotent: repeated calls leave the same state.
pub async fn cancel(config: &Config, store: &QueueStore, run_id: &Id) -> Result<()> {
    let cancelled_jobs = store.cancel_run(run_id).await?;
    store.force_release_lease(run_id).await?;
    info!(%run_id, cancelled_jobs, "run cancelled");

    let run_dir = config.run_dir(run_id);
    match Handoff::load(&run_dir) {
        Ok(handoff) if !handoff.is_cancelled() => {
            let phase = handoff.state.phase;
            let handoff = handoff.apply(
                HandoffUpdate::new(phase, RunStatus::Cancelled, String::new())
                    .with_note("Cancelled by user."),
            );
            handoff.save(&run_dir)?;
        }
        Ok(_) => {}
        Err(HandoffError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
