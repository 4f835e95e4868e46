//! Phase executor contracts.
//!
//! The four LLM-backed executors (planner, implementor, reviewer,
//! tester) are external collaborators. The engine reaches them through
//! one trait object carrying narrow request/response types; artifact
//! content beyond the fields named here is opaque.

use async_trait::async_trait;
use conveyor_core::artifacts::{
    ImplementorArtifact, ImplementorHandoff, PlanArtifact, PlanStep, ReviewArtifact, TestArtifact,
};
use conveyor_core::Handoff;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{phase} executor failed: {message}")]
    NonOk { phase: &'static str, message: String },
    #[error("failed to spawn {phase} executor: {source}")]
    Spawn {
        phase: &'static str,
        source: std::io::Error,
    },
    #[error("{phase} executor timed out after {seconds}s")]
    Timeout { phase: &'static str, seconds: u64 },
    #[error("{phase} executor returned invalid json: {source}")]
    Decode {
        phase: &'static str,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Context for the planner: the full handoff plus workspace coordinates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub handoff: Handoff,
    pub repo_root: PathBuf,
}

/// Context for one implementor step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementRequest {
    pub handoff: ImplementorHandoff,
    pub step: PlanStep,
    pub attempt: u32,
}

/// Context for the reviewer: the implementor handoff plus its result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub handoff: ImplementorHandoff,
    pub implementor: ImplementorArtifact,
}

/// Context for the tester.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub handoff: Handoff,
    pub repo_root: PathBuf,
    pub test_command: Option<String>,
    pub test_framework: Option<String>,
}

/// Proposed file mutation kinds an implementor step may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileActionKind {
    Write,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAction {
    pub path: String,
    pub action: FileActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One implementor step result: either explicit file actions or a
/// unified diff (never both; actions win when both are present).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub actions: Vec<FileAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// The external executor set, pluggable per deployment.
#[async_trait]
pub trait ExecutorSet: Send + Sync {
    async fn plan(&self, req: PlanRequest) -> Result<PlanArtifact>;
    async fn implement_step(&self, req: ImplementRequest) -> Result<StepOutput>;
    async fn review(&self, req: ReviewRequest) -> Result<ReviewArtifact>;
    async fn test(&self, req: TestRequest) -> Result<TestArtifact>;
}
