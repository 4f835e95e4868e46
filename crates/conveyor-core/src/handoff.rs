//! The handoff document.
//!
//! Per-run JSON persisted at `<run_dir>/handoff.json`. The engine's source
//! of truth for run progress: phase, status, append-only history, artifact
//! pointers, and the next-agent designation. All transformations are pure
//! values; the file is rewritten atomically (write-then-rename) so
//! concurrent readers never observe a partial document.

use crate::types::{Agent, Id, Phase, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Canonical handoff filename within a run directory.
pub const HANDOFF_FILE: &str = "handoff.json";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid handoff json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("handoff not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, HandoffError>;

/// Repository coordinates for a run. `root` and `branch` stay empty until
/// the plan phase clones the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    pub root: String,
    pub branch: String,
    pub base_branch: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub repo: RepoInfo,
    pub keep_workspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: Id,
    pub prompt: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub phase: Phase,
    pub status: RunStatus,
    pub ended_at: DateTime<Utc>,
    pub artifact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub phase: Phase,
    pub status: RunStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<HistoryEntry>,
}

/// Run-scoped constraints carried across phases. Unknown keys survive a
/// round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_tests_for_behavior_change: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Pointer to the next phase executor and its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStep {
    pub agent: Agent,
    pub input_artifacts: Vec<String>,
    pub instructions: Vec<String>,
}

impl NextStep {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            input_artifacts: Vec::new(),
            instructions: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = String>) -> Self {
        self.input_artifacts = inputs.into_iter().collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl IntoIterator<Item = String>) -> Self {
        self.instructions = instructions.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub run: RunInfo,
    pub task: TaskInfo,
    pub state: RunState,
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextStep>,
    pub notes: Vec<String>,
}

/// Parameters for a freshly submitted run.
#[derive(Debug, Clone)]
pub struct QueuedParams {
    pub run_id: Id,
    pub prompt: String,
    pub repo_url: String,
    pub base_branch: Option<String>,
    pub keep_workspace: bool,
    pub max_iterations: u32,
    pub artifacts: BTreeMap<String, String>,
    pub next: NextStep,
}

/// One handoff transition. `next: None` removes the key, which is how
/// terminal states (completed pr, failed, cancelled) are written.
#[derive(Debug, Clone)]
pub struct HandoffUpdate {
    pub phase: Phase,
    pub status: RunStatus,
    pub artifact: String,
    pub ended_at: DateTime<Utc>,
    pub next: Option<NextStep>,
    pub artifacts: BTreeMap<String, String>,
    pub note: Option<String>,
    pub constraints: Option<Constraints>,
    pub iteration: Option<u32>,
}

impl HandoffUpdate {
    pub fn new(phase: Phase, status: RunStatus, artifact: impl Into<String>) -> Self {
        Self {
            phase,
            status,
            artifact: artifact.into(),
            ended_at: Utc::now(),
            next: None,
            artifacts: BTreeMap::new(),
            note: None,
            constraints: None,
            iteration: None,
        }
    }

    pub fn with_next(mut self, next: NextStep) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

impl Handoff {
    /// Build the initial handoff for a submitted run: phase `plan`,
    /// status `queued`, iteration 1, empty history and notes.
    pub fn queued(params: QueuedParams) -> Self {
        Self {
            run: RunInfo {
                id: params.run_id.clone(),
                created_at: Utc::now(),
                repo: RepoInfo {
                    root: String::new(),
                    branch: String::new(),
                    base_branch: params.base_branch.unwrap_or_default(),
                    url: params.repo_url,
                },
                keep_workspace: params.keep_workspace,
            },
            task: TaskInfo {
                id: params.run_id,
                prompt: params.prompt,
                mode: "pipeline".to_string(),
            },
            state: RunState {
                phase: Phase::Plan,
                status: RunStatus::Queued,
                iteration: 1,
                max_iterations: params.max_iterations,
                history: Vec::new(),
            },
            artifacts: params.artifacts,
            constraints: None,
            next: Some(params.next),
            notes: Vec::new(),
        }
    }

    /// Apply one transition: append the history entry, set `state.phase`
    /// and `state.status`, merge artifact pointers, replace (or remove)
    /// `next`, and append the note. History never shrinks.
    pub fn apply(mut self, update: HandoffUpdate) -> Self {
        self.state.history.push(HistoryEntry {
            phase: update.phase,
            status: update.status,
            ended_at: update.ended_at,
            artifact: update.artifact,
        });
        self.state.phase = update.phase;
        self.state.status = update.status;
        if let Some(iteration) = update.iteration {
            self.state.iteration = iteration;
        }
        self.artifacts.extend(update.artifacts);
        self.next = update.next;
        if let Some(note) = update.note {
            self.notes.push(note);
        }
        if let Some(incoming) = update.constraints {
            let merged = self.constraints.get_or_insert_with(Constraints::default);
            if incoming.require_tests_for_behavior_change.is_some() {
                merged.require_tests_for_behavior_change =
                    incoming.require_tests_for_behavior_change;
            }
            merged.extra.extend(incoming.extra);
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.status == RunStatus::Cancelled
    }

    /// Load the handoff from a run directory.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(HANDOFF_FILE);
        if !path.exists() {
            return Err(HandoffError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the handoff atomically: write a sibling temp file, then
    /// rename over `handoff.json`.
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join(HANDOFF_FILE), self)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Structural validation of a raw JSON value against the handoff schema.
///
/// Rejects documents missing `run`, `task`, the required `state` fields,
/// an `artifacts` object, or a `notes` string list. A present `next` must
/// carry `agent` plus two string lists.
pub fn is_run_handoff(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if !obj.get("run").is_some_and(|v| v.is_object()) {
        return false;
    }
    if !obj.get("task").is_some_and(|v| v.is_object()) {
        return false;
    }
    let Some(state) = obj.get("state").and_then(|v| v.as_object()) else {
        return false;
    };
    if !state.get("phase").is_some_and(|v| v.is_string())
        || !state.get("status").is_some_and(|v| v.is_string())
        || !state.get("iteration").is_some_and(|v| v.is_u64())
        || !state.get("maxIterations").is_some_and(|v| v.is_u64())
        || !state.get("history").is_some_and(|v| v.is_array())
    {
        return false;
    }
    if !obj.get("artifacts").is_some_and(|v| v.is_object()) {
        return false;
    }
    let notes_ok = obj
        .get("notes")
        .and_then(|v| v.as_array())
        .is_some_and(|items| items.iter().all(|n| n.is_string()));
    if !notes_ok {
        return false;
    }
    if let Some(next) = obj.get("next") {
        let Some(next) = next.as_object() else {
            return false;
        };
        let string_list = |key: &str| {
            next.get(key)
                .and_then(|v| v.as_array())
                .is_some_and(|items| items.iter().all(|s| s.is_string()))
        };
        if !next.get("agent").is_some_and(|v| v.is_string())
            || !string_list("inputArtifacts")
            || !string_list("instructions")
        {
            return false;
        }
    }
    true
}
