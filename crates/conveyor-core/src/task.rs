//! Task-input resolution.
//!
//! A task argument may be a literal string, a path to a `.md` file
//! (contents, whitespace-trimmed), or a path to a `.json` file holding
//! either a string or an object with one of `task` / `description` /
//! `prompt` — possibly nested one level under `task`.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to read task file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid task json in {0}: {1}")]
    Json(String, serde_json::Error),
    #[error("task file {0} contains no task text")]
    Empty(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Resolve a task argument to the task prompt string.
pub fn resolve_task_input(input: &str) -> Result<String> {
    let path = Path::new(input);
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => {
            let content = read(path)?;
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Err(TaskError::Empty(input.to_string()));
            }
            Ok(trimmed.to_string())
        }
        Some("json") => {
            let content = read(path)?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .map_err(|e| TaskError::Json(input.to_string(), e))?;
            extract_task(&value).ok_or_else(|| TaskError::Empty(input.to_string()))
        }
        _ => Ok(input.to_string()),
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| TaskError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn extract_task(value: &serde_json::Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        let trimmed = s.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    let obj = value.as_object()?;
    for key in ["task", "description", "prompt"] {
        match obj.get(key) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            // One level of nesting: {"task": {"description": "..."}}.
            Some(nested @ serde_json::Value::Object(_)) if key == "task" => {
                if let Some(found) = extract_task(nested) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}
