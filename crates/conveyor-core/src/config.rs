//! Engine configuration.
//!
//! Flat `key = value` config file plus environment overrides.
//! Precedence: CLI flags > config file > environment > defaults.

use crate::types::Id;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Engine configuration shared by the worker, submitter, and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// State root: runs, workspaces, and the queue database live here.
    pub root: PathBuf,

    // Queue timing
    pub lease_timeout_sec: u64,
    pub poll_interval_ms: u64,
    pub requeue_sleep_ms: u64,
    pub heartbeat_interval_sec: u64,

    // Budgets (operational, not semantic)
    pub max_attempts: u32,
    pub max_plan_retries: u32,
    pub max_impl_retries: u32,
    pub max_review_retries: u32,

    // Workspace
    pub branch_prefix: String,
    pub keep_workspace: bool,

    // External executor commands (run via `sh -c`, context JSON on stdin)
    pub planner_cmd: Option<String>,
    pub implementor_cmd: Option<String>,
    pub reviewer_cmd: Option<String>,
    pub tester_cmd: Option<String>,
    /// Per-invocation timeout for executor commands (0 = none).
    pub executor_timeout_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            lease_timeout_sec: 300,
            poll_interval_ms: 1000,
            requeue_sleep_ms: 200,
            heartbeat_interval_sec: 15,
            max_attempts: 3,
            max_plan_retries: 2,
            max_impl_retries: 3,
            max_review_retries: 3,
            branch_prefix: "conveyor".to_string(),
            keep_workspace: false,
            planner_cmd: None,
            implementor_cmd: None,
            reviewer_cmd: None,
            tester_cmd: None,
            executor_timeout_sec: 0,
        }
    }
}

/// Default state root: `$CONVEYOR_ROOT`, else `~/.local/share/conveyor`.
fn default_root() -> PathBuf {
    if let Ok(root) = std::env::var("CONVEYOR_ROOT") {
        return PathBuf::from(root);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conveyor")
}

impl Config {
    /// Load from a `key = value` file, starting from defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        let content = std::fs::read_to_string(path)?;
        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidLine(raw.to_string()));
            };
            config.set(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "root" => self.root = PathBuf::from(value),
            "lease_timeout_sec" => self.lease_timeout_sec = parse_int(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_int(key, value)?,
            "requeue_sleep_ms" => self.requeue_sleep_ms = parse_int(key, value)?,
            "heartbeat_interval_sec" => self.heartbeat_interval_sec = parse_int(key, value)?,
            "max_attempts" => self.max_attempts = parse_int(key, value)? as u32,
            "max_plan_retries" => self.max_plan_retries = parse_int(key, value)? as u32,
            "max_impl_retries" => self.max_impl_retries = parse_int(key, value)? as u32,
            "max_review_retries" => self.max_review_retries = parse_int(key, value)? as u32,
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "keep_workspace" => self.keep_workspace = parse_bool(key, value)?,
            "planner_cmd" => self.planner_cmd = some_nonempty(value),
            "implementor_cmd" => self.implementor_cmd = some_nonempty(value),
            "reviewer_cmd" => self.reviewer_cmd = some_nonempty(value),
            "tester_cmd" => self.tester_cmd = some_nonempty(value),
            "executor_timeout_sec" => self.executor_timeout_sec = parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    // --- Derived paths (§6 persisted layout) ---

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &Id) -> PathBuf {
        self.runs_dir().join(run_id.as_ref())
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn workspace_dir(&self, run_id: &Id) -> PathBuf {
        self.workspaces_dir().join(run_id.as_ref())
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("queue.db")
    }

    // --- Durations ---

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn requeue_sleep(&self) -> Duration {
        Duration::from_millis(self.requeue_sleep_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn some_nonempty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
