//! Plan phase: provision the workspace and produce `plan.json`.

use super::{PhaseCtx, PhaseError, Result};
use crate::executor::{ExecutorError, PlanRequest};
use crate::workspace::WorkspaceInfo;
use conveyor_core::artifacts::{write_artifact, ArtifactKind, PlanArtifact};
use conveyor_core::handoff::Constraints;
use conveyor_core::{Agent, Handoff, HandoffUpdate, NextStep, Phase, RunStatus};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub(super) async fn run(ctx: &PhaseCtx<'_>, mut handoff: Handoff) -> Result<Option<Phase>> {
    if handoff.run.repo.url.is_empty() {
        return Err(PhaseError::Validation(
            "run has no repository url".to_string(),
        ));
    }

    // A recovered plan job may already have a workspace on disk; reuse
    // its coordinates instead of cloning again.
    let repo = handoff.run.repo.clone();
    let workspace = if repo.root.is_empty() || !Path::new(&repo.root).exists() {
        let base = (!repo.base_branch.is_empty()).then_some(repo.base_branch.as_str());
        ctx.workspaces
            .prepare(ctx.run_id, &repo.url, base, &handoff.task.prompt)
            .await?
    } else {
        WorkspaceInfo {
            root: PathBuf::from(&repo.root),
            branch: repo.branch.clone(),
            base_branch: repo.base_branch.clone(),
        }
    };

    handoff.run.repo.root = workspace.root.display().to_string();
    handoff.run.repo.branch = workspace.branch.clone();
    handoff.run.repo.base_branch = workspace.base_branch.clone();
    handoff.save(&ctx.run_dir)?;

    let plan = call_planner(ctx, &handoff, workspace.root.clone()).await?;
    let kind = ArtifactKind::Plan;
    write_artifact(&ctx.run_dir, kind.filename(), &plan)?;

    let requires_tests = plan.requires_tests();
    info!(run_id = %ctx.run_id, steps = plan.steps.len(), requires_tests, "plan written");

    let handoff = handoff.apply(
        HandoffUpdate::new(Phase::Plan, RunStatus::Completed, kind.filename())
            .with_constraints(Constraints {
                require_tests_for_behavior_change: Some(requires_tests),
                extra: serde_json::Map::new(),
            })
            .with_next(
                NextStep::new(Agent::Implementer).with_inputs([kind.filename().to_string()]),
            ),
    );
    handoff.save(&ctx.run_dir)?;

    Ok(Some(Phase::Implement))
}

async fn call_planner(
    ctx: &PhaseCtx<'_>,
    handoff: &Handoff,
    repo_root: PathBuf,
) -> Result<PlanArtifact> {
    let attempts = ctx.config.max_plan_retries.max(1);
    let mut last_error: Option<ExecutorError> = None;

    for attempt in 1..=attempts {
        let request = PlanRequest {
            handoff: handoff.clone(),
            repo_root: repo_root.clone(),
        };
        match ctx.executors.plan(request).await {
            Ok(plan) => return Ok(plan),
            Err(error) => {
                warn!(run_id = %ctx.run_id, attempt, %error, "planner attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error
        .unwrap_or(ExecutorError::NonOk {
            phase: "planner",
            message: "no attempts made".to_string(),
        })
        .into())
}
