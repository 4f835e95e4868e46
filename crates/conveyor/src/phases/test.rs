//! Test phase: run the external tester, or skip when the plan marked no
//! task as requiring tests.

use super::{PhaseCtx, PhaseError, Result};
use crate::executor::TestRequest;
use conveyor_core::artifacts::{
    read_artifact, snapshot_filename, write_artifact, ArtifactKind, PlanArtifact, TestArtifact,
};
use conveyor_core::{Agent, Handoff, HandoffUpdate, NextStep, Phase, RunStatus};
use std::path::PathBuf;
use tracing::info;

pub(super) async fn run(ctx: &PhaseCtx<'_>, handoff: Handoff) -> Result<Option<Phase>> {
    let require_tests = handoff
        .constraints
        .as_ref()
        .and_then(|c| c.require_tests_for_behavior_change)
        .unwrap_or(true);

    let artifact = if require_tests {
        // Tolerate a missing plan here; it only contributes the command.
        let plan: PlanArtifact =
            read_artifact(&ctx.run_dir, ArtifactKind::Plan.filename()).unwrap_or_default();

        if let Some(name) = snapshot_filename(Phase::Test) {
            write_artifact(&ctx.run_dir, name, &handoff)?;
        }

        ctx.executors
            .test(TestRequest {
                handoff: handoff.clone(),
                repo_root: PathBuf::from(&handoff.run.repo.root),
                test_command: plan.test_command,
                test_framework: plan.test_framework,
            })
            .await?
    } else {
        info!(run_id = %ctx.run_id, "no task requires tests; writing skipped result");
        TestArtifact::skipped()
    };

    let kind = ArtifactKind::Test;
    write_artifact(&ctx.run_dir, kind.filename(), &artifact)?;

    if !artifact.passed() {
        let reason = format!("Tests failed: status {}", artifact.status);
        let handoff = handoff.apply(
            HandoffUpdate::new(Phase::Test, RunStatus::Failed, kind.filename())
                .with_note(reason.clone()),
        );
        handoff.save(&ctx.run_dir)?;
        return Err(PhaseError::RunFailed(reason));
    }

    info!(run_id = %ctx.run_id, skipped = artifact.skipped, "tests passed");
    let handoff = handoff.apply(
        HandoffUpdate::new(Phase::Test, RunStatus::Completed, kind.filename()).with_next(
            NextStep::new(Agent::Publisher)
                .with_inputs([ArtifactKind::Implementor.filename().to_string()]),
        ),
    );
    handoff.save(&ctx.run_dir)?;

    Ok(Some(Phase::Pr))
}
