//! Phase artifacts.
//!
//! Canonical filenames plus tolerant schemas for the per-phase JSON
//! outputs. The engine treats artifact content as opaque except for the
//! handful of fields that drive the state machine: `plan.tasks[].requiresTests`,
//! `review.decision`, and the implementor result feeding the next step.

use crate::handoff::{Handoff, RepoInfo};
use crate::types::{Phase, ReviewDecision};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid artifact json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// The five primary artifact kinds, one per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Plan,
    Implementor,
    Review,
    Test,
    PrDraft,
}

impl ArtifactKind {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Plan => Self::Plan,
            Phase::Implement => Self::Implementor,
            Phase::Review => Self::Review,
            Phase::Test => Self::Test,
            Phase::Pr => Self::PrDraft,
        }
    }

    /// Key in the handoff's `artifacts` map.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implementor => "implementor",
            Self::Review => "review",
            Self::Test => "test",
            Self::PrDraft => "prDraft",
        }
    }

    pub fn filename(&self) -> &'static str {
        match self {
            Self::Plan => "plan.json",
            Self::Implementor => "implementor.json",
            Self::Review => "review.json",
            Self::Test => "test.json",
            Self::PrDraft => "pr-draft.json",
        }
    }

    pub fn error_filename(&self) -> &'static str {
        match self {
            Self::Plan => "plan.error.json",
            Self::Implementor => "implementor.error.json",
            Self::Review => "review.error.json",
            Self::Test => "test.error.json",
            Self::PrDraft => "pr-draft.error.json",
        }
    }
}

/// Secondary handoff snapshot written before invoking a phase executor.
pub fn snapshot_filename(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Implement => Some("handoff.implementor.json"),
        Phase::Review => Some("handoff.review.json"),
        Phase::Test => Some("handoff.test.json"),
        Phase::Plan | Phase::Pr => None,
    }
}

/// Artifact kept from a failed implementor attempt.
pub fn implementor_failed_filename(attempt: u32) -> String {
    format!("implementor.failed.{attempt}.json")
}

/// The artifact map a freshly submitted run starts with.
pub fn canonical_artifacts() -> BTreeMap<String, String> {
    [
        ArtifactKind::Plan,
        ArtifactKind::Implementor,
        ArtifactKind::Review,
        ArtifactKind::Test,
        ArtifactKind::PrDraft,
    ]
    .into_iter()
    .map(|k| (k.key().to_string(), k.filename().to_string()))
    .collect()
}

// --- Artifact schemas ---

/// `plan.json`. Unknown keys pass through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanArtifact {
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub allowed_files: Vec<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_framework: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PlanArtifact {
    /// True when any planned task requires tests.
    pub fn requires_tests(&self) -> bool {
        self.tasks.iter().any(|t| t.requires_tests)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanTask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "requiresTests", alias = "requires_tests")]
    pub requires_tests: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `review.json`. Only `decision` drives the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewArtifact {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `test.json`. Anything other than `status == "passed"` fails the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestArtifact {
    pub status: String,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestArtifact {
    pub fn passed(&self) -> bool {
        self.status == "passed"
    }

    /// Synthetic result for runs whose plan requires no tests.
    pub fn skipped() -> Self {
        Self {
            status: "passed".to_string(),
            skipped: true,
            summary: Some("skipped: plan requires no behavior-change tests".to_string()),
            extra: serde_json::Map::new(),
        }
    }
}

/// `implementor.json`, produced by the engine after all steps apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementorArtifact {
    pub task_id: String,
    pub steps: Vec<StepOutcome>,
    pub changed_files: Vec<String>,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `pr-draft.json`: the terminal artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDraft {
    pub task_id: String,
    pub status: String,
    pub repo: PrRepo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRepo {
    pub root: String,
    pub branch: String,
    pub base_branch: String,
}

impl From<&RepoInfo> for PrRepo {
    fn from(repo: &RepoInfo) -> Self {
        Self {
            root: repo.root.clone(),
            branch: repo.branch.clone(),
            base_branch: repo.base_branch.clone(),
        }
    }
}

/// `*.error.json` sibling written when a phase fails operationally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorArtifact {
    pub phase: Phase,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// The executor-facing handoff for implement/review: the plan plus the
/// current on-disk content of every existing allowed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementorHandoff {
    pub handoff: Handoff,
    pub plan: PlanArtifact,
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub feedback: Vec<String>,
}

// --- File helpers ---

/// Write an artifact atomically under the run directory.
pub fn write_artifact<T: Serialize>(run_dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = run_dir.join(name);
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn read_artifact<T: DeserializeOwned>(run_dir: &Path, name: &str) -> Result<T> {
    let path = run_dir.join(name);
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.display().to_string()));
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write the `*.error.json` sibling for a failed phase.
pub fn write_error_artifact(run_dir: &Path, phase: Phase, error: &str) -> Result<()> {
    let kind = ArtifactKind::for_phase(phase);
    write_artifact(
        run_dir,
        kind.error_filename(),
        &ErrorArtifact {
            phase,
            error: error.to_string(),
            at: Utc::now(),
        },
    )
}
