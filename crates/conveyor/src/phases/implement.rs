//! Implement phase: expand the plan's steps, apply the implementor's
//! mutations under the allowed-files constraint, and produce
//! `implementor.json` with the merged diff.

use super::{PhaseCtx, PhaseError, Result};
use crate::executor::{FileAction, FileActionKind, ImplementRequest, StepOutput};
use crate::git;
use conveyor_core::artifacts::{
    implementor_failed_filename, read_artifact, snapshot_filename, write_artifact, ArtifactKind,
    ImplementorArtifact, ImplementorHandoff, PlanArtifact, PlanStep, StepOutcome,
};
use conveyor_core::{Agent, Handoff, HandoffUpdate, NextStep, Phase, RunStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use tracing::{debug, info, warn};

/// One file mutation. Both implementor result forms (explicit actions
/// and unified patches) reduce to this, so the allowed-files constraint
/// is enforced in exactly one place.
#[derive(Debug, Clone)]
pub enum Mutation {
    WriteFile { path: String, content: String },
    DeleteFile { path: String },
    ApplyPatch { diff: String },
}

impl Mutation {
    /// Paths this mutation touches, for constraint checks and the
    /// changed-files set.
    fn paths(&self) -> Vec<String> {
        match self {
            Self::WriteFile { path, .. } | Self::DeleteFile { path } => vec![path.clone()],
            Self::ApplyPatch { diff } => git::changed_paths(diff),
        }
    }
}

pub(super) async fn run(ctx: &PhaseCtx<'_>, handoff: Handoff) -> Result<Option<Phase>> {
    let plan: PlanArtifact =
        read_artifact(&ctx.run_dir, ArtifactKind::Plan.filename()).map_err(|e| {
            PhaseError::Validation(format!("cannot resolve plan artifact: {e}"))
        })?;

    let repo_root = Path::new(&handoff.run.repo.root);
    if handoff.run.repo.root.is_empty() || !repo_root.exists() {
        return Err(PhaseError::Validation(
            "run workspace is missing; plan did not complete".to_string(),
        ));
    }

    let allowed = expand_allowed_files(&plan.allowed_files, repo_root)?;
    let steps = expand_steps(&plan.steps, repo_root)?;

    // Reviewer feedback from a rejected iteration rides on `next`.
    let feedback = handoff
        .next
        .as_ref()
        .map(|n| n.instructions.clone())
        .unwrap_or_default();

    let mut files = inject_files(repo_root, &allowed);
    let snapshot = ImplementorHandoff {
        handoff: handoff.clone(),
        plan: plan.clone(),
        files: files.clone(),
        feedback: feedback.clone(),
    };
    if let Some(name) = snapshot_filename(Phase::Implement) {
        write_artifact(&ctx.run_dir, name, &snapshot)?;
    }

    let mut changed_files: Vec<String> = Vec::new();
    let mut outcomes: Vec<StepOutcome> = Vec::new();

    for step in &steps {
        let outcome = run_step(
            ctx,
            &handoff,
            &plan,
            step,
            &allowed,
            &feedback,
            &files,
            &mut changed_files,
        )
        .await?;
        outcomes.push(outcome);
        // The next step sees what this one wrote.
        files = inject_files(repo_root, &allowed);
    }

    let diff = git::diff(repo_root, &changed_files)?;
    let artifact = ImplementorArtifact {
        task_id: handoff.task.id.to_string(),
        steps: outcomes,
        changed_files: changed_files.clone(),
        diff,
    };
    let kind = ArtifactKind::Implementor;
    write_artifact(&ctx.run_dir, kind.filename(), &artifact)?;
    info!(run_id = %ctx.run_id, steps = steps.len(), changed = changed_files.len(),
        "implementation applied");

    let handoff = handoff.apply(
        HandoffUpdate::new(Phase::Implement, RunStatus::Completed, kind.filename()).with_next(
            NextStep::new(Agent::Reviewer).with_inputs([kind.filename().to_string()]),
        ),
    );
    handoff.save(&ctx.run_dir)?;

    Ok(Some(Phase::Review))
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    ctx: &PhaseCtx<'_>,
    handoff: &Handoff,
    plan: &PlanArtifact,
    step: &PlanStep,
    allowed: &BTreeSet<String>,
    feedback: &[String],
    files: &BTreeMap<String, String>,
    changed_files: &mut Vec<String>,
) -> Result<StepOutcome> {
    let repo_root = Path::new(&handoff.run.repo.root);
    let attempts = ctx.config.max_impl_retries.max(1);
    let mut last_error: Option<PhaseError> = None;

    for attempt in 1..=attempts {
        let request = ImplementRequest {
            handoff: ImplementorHandoff {
                handoff: handoff.clone(),
                plan: plan.clone(),
                files: files.clone(),
                feedback: feedback.to_vec(),
            },
            step: step.clone(),
            attempt,
        };

        let output = match ctx.executors.implement_step(request).await {
            Ok(output) => output,
            Err(error) => {
                warn!(run_id = %ctx.run_id, step = %step.id, attempt, %error,
                    "implementor attempt failed");
                last_error = Some(error.into());
                continue;
            }
        };

        match apply_output(repo_root, allowed, &output, changed_files) {
            Ok(()) => {
                return Ok(StepOutcome {
                    step_id: step.id.clone(),
                    attempts: attempt,
                    summary: output.summary,
                });
            }
            Err(error) => {
                warn!(run_id = %ctx.run_id, step = %step.id, attempt, %error,
                    "implementor result rejected");
                // Keep the rejected result for postmortems.
                let _ = write_artifact(&ctx.run_dir, &implementor_failed_filename(attempt), &output);
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        PhaseError::Validation(format!("implementor step {} produced no result", step.id))
    }))
}

/// Reduce one step result to mutations, enforce the allowed-files
/// constraint across all of them, then apply. Nothing touches disk if
/// any path is out of bounds.
fn apply_output(
    repo_root: &Path,
    allowed: &BTreeSet<String>,
    output: &StepOutput,
    changed_files: &mut Vec<String>,
) -> Result<()> {
    let mutations = mutations_from(output)?;

    for mutation in &mutations {
        for path in mutation.paths() {
            check_path(&path, allowed)?;
        }
    }

    for mutation in &mutations {
        let touched = mutation.paths();
        match mutation {
            Mutation::WriteFile { path, content } => {
                let target = repo_root.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)?;
                debug!(path, "wrote file");
            }
            Mutation::DeleteFile { path } => {
                let target = repo_root.join(path);
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                debug!(path, "deleted file");
            }
            Mutation::ApplyPatch { diff } => {
                git::apply_patch(repo_root, diff)?;
                debug!(paths = touched.len(), "applied patch");
            }
        }
        for path in touched {
            if !changed_files.contains(&path) {
                changed_files.push(path);
            }
        }
    }

    Ok(())
}

fn mutations_from(output: &StepOutput) -> Result<Vec<Mutation>> {
    if !output.actions.is_empty() {
        return output.actions.iter().map(mutation_from_action).collect();
    }
    if let Some(diff) = output.diff.as_ref().filter(|d| !d.is_empty()) {
        return Ok(vec![Mutation::ApplyPatch { diff: diff.clone() }]);
    }
    Err(PhaseError::Validation(
        "implementor result carries neither file actions nor a diff".to_string(),
    ))
}

fn mutation_from_action(action: &FileAction) -> Result<Mutation> {
    match action.action {
        FileActionKind::Write => {
            let content = action.content.clone().ok_or_else(|| {
                PhaseError::Validation(format!("write action for {} has no content", action.path))
            })?;
            Ok(Mutation::WriteFile {
                path: action.path.clone(),
                content,
            })
        }
        FileActionKind::Delete => Ok(Mutation::DeleteFile {
            path: action.path.clone(),
        }),
    }
}

fn check_path(path: &str, allowed: &BTreeSet<String>) -> Result<()> {
    let p = Path::new(path);
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PhaseError::Validation(format!(
            "path escapes the repository root: {path}"
        )));
    }
    if !allowed.contains(path) {
        return Err(PhaseError::Validation(format!(
            "path is outside allowed_files: {path}"
        )));
    }
    Ok(())
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand glob entries against the repo root. The enforcement set is the
/// expanded matches plus every non-glob entry verbatim.
pub(super) fn expand_allowed_files(
    entries: &[String],
    repo_root: &Path,
) -> Result<BTreeSet<String>> {
    let mut allowed = BTreeSet::new();
    for entry in entries {
        if is_glob(entry) {
            for path in glob_relative(entry, repo_root)? {
                allowed.insert(path);
            }
        } else {
            allowed.insert(entry.clone());
        }
    }
    Ok(allowed)
}

/// Expand step file globs: one step per match with a synthesized unique
/// id. Non-glob steps pass through verbatim.
pub(super) fn expand_steps(steps: &[PlanStep], repo_root: &Path) -> Result<Vec<PlanStep>> {
    let mut expanded = Vec::new();
    for step in steps {
        match step.file.as_deref().filter(|f| is_glob(f)) {
            Some(pattern) => {
                for (index, path) in glob_relative(pattern, repo_root)?.into_iter().enumerate() {
                    let mut copy = step.clone();
                    copy.id = format!("{}-{}", step.id, index + 1);
                    copy.file = Some(path);
                    expanded.push(copy);
                }
            }
            None => expanded.push(step.clone()),
        }
    }
    Ok(expanded)
}

fn glob_relative(pattern: &str, repo_root: &Path) -> Result<Vec<String>> {
    let full = repo_root.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| PhaseError::Validation(format!("invalid glob pattern {pattern}: {e}")))?;

    let mut matches = Vec::new();
    for entry in paths.flatten() {
        if let Ok(relative) = entry.strip_prefix(repo_root) {
            matches.push(relative.to_string_lossy().to_string());
        }
    }
    Ok(matches)
}

/// Current content of every existing allowed file. Unreadable (e.g.
/// binary) files are skipped.
pub(super) fn inject_files(
    repo_root: &Path,
    allowed: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for path in allowed {
        let full = repo_root.join(path);
        if !full.is_file() {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&full) {
            files.insert(path.clone(), content);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo_with(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn expand_allowed_files_mixes_globs_and_verbatim() {
        let repo = repo_with(&[("src/a.rs", ""), ("src/b.rs", ""), ("docs/x.md", "")]);
        let allowed = expand_allowed_files(
            &["src/*.rs".to_string(), "Cargo.toml".to_string()],
            repo.path(),
        )
        .unwrap();

        assert!(allowed.contains("src/a.rs"));
        assert!(allowed.contains("src/b.rs"));
        // Non-glob entries are kept verbatim even when absent on disk.
        assert!(allowed.contains("Cargo.toml"));
        assert!(!allowed.contains("docs/x.md"));
    }

    #[test]
    fn expand_steps_synthesizes_unique_ids() {
        let repo = repo_with(&[("src/a.rs", ""), ("src/b.rs", "")]);
        let steps = vec![PlanStep {
            id: "s1".to_string(),
            file: Some("src/*.rs".to_string()),
            instructions: "touch".to_string(),
            extra: serde_json::Map::new(),
        }];

        let expanded = expand_steps(&steps, repo.path()).unwrap();
        assert_eq!(expanded.len(), 2);
        let ids: Vec<&str> = expanded.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1-1", "s1-2"]);
        assert!(expanded.iter().all(|s| s.file.is_some()));
    }

    #[test]
    fn expand_steps_passes_non_glob_through() {
        let repo = repo_with(&[]);
        let steps = vec![PlanStep {
            id: "s1".to_string(),
            file: Some("src/new.rs".to_string()),
            instructions: String::new(),
            extra: serde_json::Map::new(),
        }];
        let expanded = expand_steps(&steps, repo.path()).unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].id, "s1");
    }

    #[test]
    fn inject_files_reads_existing_allowed_files() {
        let repo = repo_with(&[("src/a.rs", "fn a() {}")]);
        let allowed = BTreeSet::from(["src/a.rs".to_string(), "src/missing.rs".to_string()]);
        let files = inject_files(repo.path(), &allowed);
        assert_eq!(files.len(), 1);
        assert_eq!(files["src/a.rs"], "fn a() {}");
    }

    #[test]
    fn write_action_applies_and_tracks_changed_file() {
        let repo = repo_with(&[]);
        let allowed = BTreeSet::from(["src/new.rs".to_string()]);
        let output = StepOutput {
            actions: vec![FileAction {
                path: "src/new.rs".to_string(),
                action: FileActionKind::Write,
                content: Some("fn new() {}".to_string()),
            }],
            diff: None,
            summary: None,
        };

        let mut changed = Vec::new();
        apply_output(repo.path(), &allowed, &output, &mut changed).unwrap();
        assert_eq!(changed, vec!["src/new.rs"]);
        assert_eq!(
            std::fs::read_to_string(repo.path().join("src/new.rs")).unwrap(),
            "fn new() {}"
        );
    }

    #[test]
    fn delete_action_removes_file() {
        let repo = repo_with(&[("old.rs", "x")]);
        let allowed = BTreeSet::from(["old.rs".to_string()]);
        let output = StepOutput {
            actions: vec![FileAction {
                path: "old.rs".to_string(),
                action: FileActionKind::Delete,
                content: None,
            }],
            diff: None,
            summary: None,
        };

        let mut changed = Vec::new();
        apply_output(repo.path(), &allowed, &output, &mut changed).unwrap();
        assert!(!repo.path().join("old.rs").exists());
    }

    #[test]
    fn out_of_bounds_path_rejects_whole_result() {
        let repo = repo_with(&[]);
        let allowed = BTreeSet::from(["src/ok.rs".to_string()]);
        let output = StepOutput {
            actions: vec![
                FileAction {
                    path: "src/ok.rs".to_string(),
                    action: FileActionKind::Write,
                    content: Some("fine".to_string()),
                },
                FileAction {
                    path: "src/evil.rs".to_string(),
                    action: FileActionKind::Write,
                    content: Some("nope".to_string()),
                },
            ],
            diff: None,
            summary: None,
        };

        let mut changed = Vec::new();
        let err = apply_output(repo.path(), &allowed, &output, &mut changed).unwrap_err();
        assert!(matches!(err, PhaseError::Validation(_)));
        // Nothing was applied, not even the in-bounds action.
        assert!(!repo.path().join("src/ok.rs").exists());
        assert!(changed.is_empty());
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let allowed = BTreeSet::from(["../outside.rs".to_string()]);
        assert!(matches!(
            check_path("../outside.rs", &allowed),
            Err(PhaseError::Validation(_))
        ));
        assert!(matches!(
            check_path("/etc/passwd", &allowed),
            Err(PhaseError::Validation(_))
        ));
    }

    #[test]
    fn empty_result_is_invalid() {
        let output = StepOutput::default();
        assert!(matches!(
            mutations_from(&output),
            Err(PhaseError::Validation(_))
        ));
    }

    #[test]
    fn write_action_without_content_is_invalid() {
        let output = StepOutput {
            actions: vec![FileAction {
                path: "a.rs".to_string(),
                action: FileActionKind::Write,
                content: None,
            }],
            diff: None,
            summary: None,
        };
        assert!(matches!(
            mutations_from(&output),
            Err(PhaseError::Validation(_))
        ));
    }

    #[test]
    fn actions_win_over_diff_when_both_present() {
        let output = StepOutput {
            actions: vec![FileAction {
                path: "a.rs".to_string(),
                action: FileActionKind::Delete,
                content: None,
            }],
            diff: Some("diff --git a/b.rs b/b.rs\n".to_string()),
            summary: None,
        };
        let mutations = mutations_from(&output).unwrap();
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], Mutation::DeleteFile { .. }));
    }
}
