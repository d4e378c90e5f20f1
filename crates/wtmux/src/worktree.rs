// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only view of the worktree registry.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One task entry of the worktree registry. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_no: String,
    pub path: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// Overrides the configured dev command for this task.
    #[serde(default)]
    pub command: Option<String>,
}

impl TaskRecord {
    /// The port the task's dev server listens on.
    ///
    /// A `PORT=` entry in the worktree's `.env` wins over the registry value.
    /// Zero counts as no port.
    pub fn effective_port(&self) -> Option<u16> {
        read_env_port(&self.path.join(".env")).or(self.port).filter(|port| *port != 0)
    }
}

/// Source of task records.
pub trait TaskDirectory: Send + Sync + 'static {
    fn list_tasks(&self) -> anyhow::Result<Vec<TaskRecord>>;

    fn find_task(&self, task_key: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.list_tasks()?.into_iter().find(|task| task.task_no == task_key))
    }
}

/// Reads the registry's `active.json` on every call.
pub struct JsonTaskStore {
    path: PathBuf,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TaskDirectory for JsonTaskStore {
    fn list_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).with_context(|| format!("parse {}", self.path.display()))
    }
}

/// Extract `PORT` from a dotenv file, if present and numeric.
fn read_env_port(path: &Path) -> Option<u16> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.lines().find_map(|line| {
        let line = line.trim();
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=')?;
        if key.trim() != "PORT" {
            return None;
        }
        value.trim().trim_matches(|c| c == '"' || c == '\'').parse().ok()
    })
}

#[cfg(test)]
#[path = "worktree_tests.rs"]
mod tests;
