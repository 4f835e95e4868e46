//! Phase dispatch.
//!
//! Each worker job maps to one phase execution: read the handoff, run
//! the phase, write artifacts, record the transition, and name the next
//! phase to enqueue. Cancellation is observed here, before any side
//! effect, by reading the handoff's status.

mod implement;
mod plan;
mod pr;
mod review;
mod test;

use crate::executor::{ExecutorError, ExecutorSet};
use crate::git::GitError;
use crate::queue::QueueError;
use crate::workspace::{WorkspaceError, WorkspaceProvider};
use conveyor_core::artifacts::{self, ArtifactError};
use conveyor_core::handoff::HandoffError;
use conveyor_core::{Config, Handoff, Id, Phase};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PhaseError {
    /// The handoff was observed cancelled; the job fails but the
    /// cancelled handoff must not be overwritten.
    #[error("Run cancelled.")]
    Cancelled,
    /// Semantic run failure (reviewer verdict, failing tests). The phase
    /// has already written the terminal handoff.
    #[error("{0}")]
    RunFailed(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhaseError {
    /// Transient store or filesystem faults. These are not a verdict on
    /// the job: the worker requeues it and retries after a sleep instead
    /// of failing the run or touching the handoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Queue(_)
                | Self::Io(_)
                | Self::Handoff(HandoffError::Io(_))
                | Self::Artifact(ArtifactError::Io(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, PhaseError>;

/// Everything a phase execution needs.
pub struct PhaseCtx<'a> {
    pub config: &'a Config,
    pub run_id: &'a Id,
    pub run_dir: PathBuf,
    pub executors: &'a dyn ExecutorSet,
    pub workspaces: &'a dyn WorkspaceProvider,
}

/// Execute one phase for the run. Returns the next phase to enqueue, or
/// `None` when the pipeline is finished.
///
/// Operational failures leave a `*.error.json` sibling beside the
/// phase's primary artifact; cancellation and semantic run failures do
/// not (the latter already produced their real artifact).
pub async fn dispatch(ctx: &PhaseCtx<'_>, phase: Phase) -> Result<Option<Phase>> {
    let handoff = Handoff::load(&ctx.run_dir)?;
    if handoff.is_cancelled() {
        return Err(PhaseError::Cancelled);
    }

    let result = match phase {
        Phase::Plan => plan::run(ctx, handoff).await,
        Phase::Implement => implement::run(ctx, handoff).await,
        Phase::Review => review::run(ctx, handoff).await,
        Phase::Test => test::run(ctx, handoff).await,
        Phase::Pr => pr::run(ctx, handoff).await,
    };

    if let Err(error) = &result {
        let permanent = !matches!(error, PhaseError::Cancelled | PhaseError::RunFailed(_))
            && !error.is_transient();
        if permanent {
            if let Err(write_error) =
                artifacts::write_error_artifact(&ctx.run_dir, phase, &error.to_string())
            {
                warn!(run_id = %ctx.run_id, phase = phase.as_str(), error = %write_error,
                    "failed to write error artifact");
            }
        }
    }

    result
}
