//! Command-backed executor adapter.
//!
//! Each phase executor is an external command configured in the engine
//! config (`planner_cmd`, `implementor_cmd`, `reviewer_cmd`,
//! `tester_cmd`), run via `sh -c`. The phase context is written to the
//! child's stdin as JSON; the artifact is read from its stdout. Both
//! pipes are fully drained before the child is reaped, and a configured
//! timeout bounds each invocation. Environment (`OPENAI_*` and friends)
//! passes through untouched.

use crate::executor::{
    ExecutorError, ExecutorSet, ImplementRequest, PlanRequest, Result, ReviewRequest, StepOutput,
    TestRequest,
};
use async_trait::async_trait;
use conveyor_core::artifacts::{PlanArtifact, ReviewArtifact, TestArtifact};
use conveyor_core::Config;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

pub struct CommandExecutors {
    planner: Option<String>,
    implementor: Option<String>,
    reviewer: Option<String>,
    tester: Option<String>,
    /// Per-invocation timeout in seconds (0 = none).
    timeout_sec: u64,
}

impl CommandExecutors {
    pub fn from_config(config: &Config) -> Self {
        Self {
            planner: config.planner_cmd.clone(),
            implementor: config.implementor_cmd.clone(),
            reviewer: config.reviewer_cmd.clone(),
            tester: config.tester_cmd.clone(),
            timeout_sec: config.executor_timeout_sec,
        }
    }

    async fn invoke<T: Serialize>(
        &self,
        phase: &'static str,
        cmd: Option<&str>,
        request: &T,
    ) -> Result<serde_json::Value> {
        let Some(cmd) = cmd else {
            return Err(ExecutorError::NonOk {
                phase,
                message: "no executor command configured".to_string(),
            });
        };

        let input = serde_json::to_vec(request).map_err(|source| ExecutorError::Decode {
            phase,
            source,
        })?;

        debug!(phase, cmd, "spawning executor command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutorError::Spawn { phase, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|source| ExecutorError::Spawn { phase, source })?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let wait = child.wait_with_output();
        let output = if self.timeout_sec > 0 {
            match timeout(Duration::from_secs(self.timeout_sec), wait).await {
                Ok(result) => result.map_err(|source| ExecutorError::Spawn { phase, source })?,
                // The child is consumed by wait_with_output and killed
                // when dropped on this path.
                Err(_) => {
                    return Err(ExecutorError::Timeout {
                        phase,
                        seconds: self.timeout_sec,
                    })
                }
            }
        } else {
            wait.await
                .map_err(|source| ExecutorError::Spawn { phase, source })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::NonOk {
                phase,
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    tail(&stderr, 20)
                ),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|source| ExecutorError::Decode { phase, source })
    }
}

/// Last `n` lines of executor stderr, enough to diagnose without
/// flooding `last_error`.
fn tail(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[async_trait]
impl ExecutorSet for CommandExecutors {
    async fn plan(&self, req: PlanRequest) -> Result<PlanArtifact> {
        let value = self.invoke("planner", self.planner.as_deref(), &req).await?;
        serde_json::from_value(value).map_err(|source| ExecutorError::Decode {
            phase: "planner",
            source,
        })
    }

    async fn implement_step(&self, req: ImplementRequest) -> Result<StepOutput> {
        let value = self
            .invoke("implementor", self.implementor.as_deref(), &req)
            .await?;
        serde_json::from_value(value).map_err(|source| ExecutorError::Decode {
            phase: "implementor",
            source,
        })
    }

    async fn review(&self, req: ReviewRequest) -> Result<ReviewArtifact> {
        let value = self.invoke("reviewer", self.reviewer.as_deref(), &req).await?;
        serde_json::from_value(value).map_err(|source| ExecutorError::Decode {
            phase: "reviewer",
            source,
        })
    }

    async fn test(&self, req: TestRequest) -> Result<TestArtifact> {
        let value = self.invoke("tester", self.tester.as_deref(), &req).await?;
        serde_json::from_value(value).map_err(|source| ExecutorError::Decode {
            phase: "tester",
            source,
        })
    }
}
