//! Review phase: hand the implementor's work to the reviewer and route
//! on its decision.
//!
//! `approved` advances to test. `rejected` consumes one unit of the
//! iteration budget and requeues implement with the reviewer's reasons
//! attached; an exhausted budget fails the run. `blocked` fails the run
//! immediately regardless of budget.

use super::{implement, PhaseCtx, PhaseError, Result};
use crate::executor::ReviewRequest;
use conveyor_core::artifacts::{
    read_artifact, snapshot_filename, write_artifact, ArtifactKind, ImplementorArtifact,
    ImplementorHandoff, PlanArtifact,
};
use conveyor_core::{
    Agent, Handoff, HandoffUpdate, NextStep, Phase, ReviewDecision, RunStatus,
};
use std::path::Path;
use tracing::info;

pub(super) async fn run(ctx: &PhaseCtx<'_>, handoff: Handoff) -> Result<Option<Phase>> {
    let plan: PlanArtifact =
        read_artifact(&ctx.run_dir, ArtifactKind::Plan.filename()).map_err(|e| {
            PhaseError::Validation(format!("cannot resolve plan artifact: {e}"))
        })?;
    let implementor: ImplementorArtifact =
        read_artifact(&ctx.run_dir, ArtifactKind::Implementor.filename()).map_err(|e| {
            PhaseError::Validation(format!("cannot resolve implementor artifact: {e}"))
        })?;

    let repo_root = Path::new(&handoff.run.repo.root);
    let allowed = implement::expand_allowed_files(&plan.allowed_files, repo_root)?;
    let files = implement::inject_files(repo_root, &allowed);

    let review_handoff = ImplementorHandoff {
        handoff: handoff.clone(),
        plan,
        files,
        feedback: Vec::new(),
    };
    if let Some(name) = snapshot_filename(Phase::Review) {
        write_artifact(&ctx.run_dir, name, &review_handoff)?;
    }

    let review = ctx
        .executors
        .review(ReviewRequest {
            handoff: review_handoff,
            implementor,
        })
        .await?;

    let kind = ArtifactKind::Review;
    write_artifact(&ctx.run_dir, kind.filename(), &review)?;
    info!(run_id = %ctx.run_id, decision = review.decision.as_str(),
        iteration = handoff.state.iteration, "review decided");

    match review.decision {
        ReviewDecision::Approved => {
            let handoff = handoff.apply(
                HandoffUpdate::new(Phase::Review, RunStatus::Completed, kind.filename())
                    .with_next(NextStep::new(Agent::Tester).with_inputs([
                        ArtifactKind::Implementor.filename().to_string(),
                    ])),
            );
            handoff.save(&ctx.run_dir)?;
            Ok(Some(Phase::Test))
        }
        ReviewDecision::Rejected => {
            let reason = format!("Reviewer rejected: {}", review.reasons.join("; "));
            if handoff.state.iteration >= handoff.state.max_iterations {
                let handoff = handoff.apply(
                    HandoffUpdate::new(Phase::Review, RunStatus::Failed, kind.filename())
                        .with_note(reason.clone()),
                );
                handoff.save(&ctx.run_dir)?;
                Err(PhaseError::RunFailed(reason))
            } else {
                let iteration = handoff.state.iteration + 1;
                let max_iterations = handoff.state.max_iterations;
                let handoff = handoff.apply(
                    HandoffUpdate::new(Phase::Review, RunStatus::InProgress, kind.filename())
                        .with_iteration(iteration)
                        .with_next(
                            NextStep::new(Agent::Implementer)
                                .with_inputs([
                                    ArtifactKind::Plan.filename().to_string(),
                                    kind.filename().to_string(),
                                ])
                                .with_instructions(review.reasons.clone()),
                        )
                        .with_note(format!(
                            "review rejected, retrying implementation ({iteration}/{max_iterations})"
                        )),
                );
                handoff.save(&ctx.run_dir)?;
                Ok(Some(Phase::Implement))
            }
        }
        ReviewDecision::Blocked => {
            let reason = format!("Reviewer blocked: {}", review.reasons.join("; "));
            let handoff = handoff.apply(
                HandoffUpdate::new(Phase::Review, RunStatus::Failed, kind.filename())
                    .with_note(reason.clone()),
            );
            handoff.save(&ctx.run_dir)?;
            Err(PhaseError::RunFailed(reason))
        }
    }
}
