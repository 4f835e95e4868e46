//! Pr phase: write the terminal `pr-draft.json` and clean the workspace
//! up unless the run keeps it.

use super::{PhaseCtx, Result};
use conveyor_core::artifacts::{write_artifact, ArtifactKind, PrDraft, PrRepo};
use conveyor_core::{Handoff, HandoffUpdate, Phase, RunStatus};
use std::path::Path;
use tracing::{info, warn};

pub(super) async fn run(ctx: &PhaseCtx<'_>, handoff: Handoff) -> Result<Option<Phase>> {
    let draft = PrDraft {
        task_id: handoff.task.id.to_string(),
        status: "ready_for_review".to_string(),
        repo: PrRepo::from(&handoff.run.repo),
    };
    let kind = ArtifactKind::PrDraft;
    write_artifact(&ctx.run_dir, kind.filename(), &draft)?;

    let keep_workspace = handoff.run.keep_workspace;
    let workspace_root = handoff.run.repo.root.clone();

    let handoff = handoff.apply(HandoffUpdate::new(
        Phase::Pr,
        RunStatus::Completed,
        kind.filename(),
    ));
    handoff.save(&ctx.run_dir)?;
    info!(run_id = %ctx.run_id, "run completed");

    if !keep_workspace && !workspace_root.is_empty() {
        // Cleanup failure must not fail a completed run.
        if let Err(error) = ctx.workspaces.remove(Path::new(&workspace_root)).await {
            warn!(run_id = %ctx.run_id, %error, "failed to remove workspace");
        }
    }

    Ok(None)
}
