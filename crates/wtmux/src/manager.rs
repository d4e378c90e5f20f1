// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator-facing start/stop/terminal workflows.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::lock::TaskLock;
use crate::ports::PortLookup;
use crate::session::registry::{CreateOptions, SessionRegistry, TerminalSummary};
use crate::session::{is_server_session_id, ServerStatus, Session, SessionKind};
use crate::worktree::{TaskDirectory, TaskRecord};

/// Workflow settings for [`TaskManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub dev_command: String,
    pub install_command: String,
    pub stall_threshold: Duration,
    pub log_dir: PathBuf,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dev_command: config.dev_command.clone(),
            install_command: config.install_command.clone(),
            stall_threshold: config.stall_threshold(),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum StartOutcome {
    /// A new server session was spawned.
    Started { pid: Option<u32> },
    /// A listener already owned the port and was adopted instead.
    Adopted { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOutcome {
    pub destroyed_session: bool,
    pub terminated: Vec<u32>,
}

/// Server status of one task with the diagnostics needed for a stall prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_no: String,
    pub status: ServerStatus,
    pub elapsed_secs: Option<u64>,
    pub stalled: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub adopted_pid: Option<u32>,
}

/// Request to open a terminal session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRequest {
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default, alias = "initialCommand")]
    pub initial_command: Option<String>,
    #[serde(default, alias = "taskNo")]
    pub task_no: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Serializes operator workflows per task and owns adoption records.
pub struct TaskManager {
    registry: Arc<SessionRegistry>,
    tasks: Arc<dyn TaskDirectory>,
    ports: Arc<dyn PortLookup>,
    lock: TaskLock,
    adopted: Mutex<HashMap<String, u32>>,
    settings: ManagerSettings,
}

impl TaskManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        tasks: Arc<dyn TaskDirectory>,
        ports: Arc<dyn PortLookup>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            tasks,
            ports,
            lock: TaskLock::new(),
            adopted: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<dyn TaskDirectory> {
        &self.tasks
    }

    /// Start the task's dev server, or adopt a listener already on its port.
    pub async fn start_server(&self, task_key: &str) -> Result<StartOutcome, ApiError> {
        validate_task_key(task_key)?;
        self.lock.with_lock(task_key, || self.start_locked(task_key)).await
    }

    async fn start_locked(&self, task_key: &str) -> Result<StartOutcome, ApiError> {
        let task = self.find_task(task_key)?;

        if let Some(existing) = self.registry.server_session(task_key) {
            match existing.phase().status() {
                ServerStatus::Starting => {
                    return Err(ErrorCode::AlreadyStarting
                        .with(format!("{task_key} is already starting")));
                }
                ServerStatus::Running => {
                    return Err(
                        ErrorCode::AlreadyRunning.with(format!("{task_key} is already running"))
                    );
                }
                ServerStatus::Stopped => self.registry.destroy_session(&existing),
            }
        }

        let port = task
            .effective_port()
            .ok_or_else(|| ErrorCode::NoPort.with(format!("{task_key} has no port assigned")))?;

        if let Some(pid) = self.find_orphan(port).await {
            info!(task = %task_key, port, pid, "adopting existing listener");
            self.adopted.lock().insert(task_key.to_owned(), pid);
            return Ok(StartOutcome::Adopted { pid });
        }
        self.adopted.lock().remove(task_key);

        let command = self.bootstrap_command(&task);
        let session = self
            .registry
            .create(CreateOptions::server(task_key, &task.path, command))
            .map_err(|e| ErrorCode::SpawnFailed.with(format!("{e:#}")))?;
        info!(task = %task_key, port, pid = session.pid().unwrap_or(0), "started dev server");
        Ok(StartOutcome::Started { pid: session.pid() })
    }

    /// Stop the task's server and anything still listening on its port.
    ///
    /// Stopping a task that is not running succeeds.
    pub async fn stop_server(&self, task_key: &str) -> Result<StopOutcome, ApiError> {
        validate_task_key(task_key)?;
        self.lock.with_lock(task_key, || self.stop_locked(task_key)).await
    }

    async fn stop_locked(&self, task_key: &str) -> Result<StopOutcome, ApiError> {
        let destroyed_session = match self.registry.server_session(task_key) {
            Some(session) => {
                self.registry.destroy_session(&session);
                true
            }
            None => false,
        };
        let adopted = self.adopted.lock().remove(task_key);

        let port = match self.tasks.find_task(task_key) {
            Ok(task) => task.and_then(|t| t.effective_port()),
            Err(e) => {
                warn!(task = %task_key, err = %e, "task lookup failed during stop");
                None
            }
        };

        let mut targets = match port {
            Some(port) => match self.ports.listeners(port).await {
                Ok(pids) => pids,
                Err(e) => {
                    warn!(task = %task_key, port, err = %e, "port lookup failed during stop");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if let Some(pid) = adopted {
            if !targets.contains(&pid) {
                targets.push(pid);
            }
        }

        let own_pid = std::process::id();
        let mut terminated = Vec::new();
        for pid in targets.into_iter().filter(|pid| *pid != own_pid) {
            match self.ports.terminate(pid) {
                Ok(()) => terminated.push(pid),
                Err(e) => warn!(task = %task_key, pid, err = %e, "failed to terminate listener"),
            }
        }

        info!(task = %task_key, destroyed_session, terminated = terminated.len(), "stopped task");
        Ok(StopOutcome { destroyed_session, terminated })
    }

    /// Open a terminal session, generating an id when none is given.
    pub fn create_terminal(&self, request: TerminalRequest) -> Result<Arc<Session>, ApiError> {
        let id = match request.session_id {
            Some(id) if id.is_empty() => {
                return Err(ErrorCode::BadRequest.with("session id must not be empty"));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if is_server_session_id(&id) {
            return Err(ErrorCode::BadRequest.with(format!("session id {id} is reserved")));
        }

        let cwd = match (request.cwd, request.task_no.as_deref()) {
            (Some(cwd), _) => cwd,
            (None, Some(task_key)) => self.find_task(task_key)?.path,
            (None, None) => default_cwd(),
        };

        self.registry
            .create(CreateOptions {
                id,
                kind: SessionKind::Terminal,
                cwd,
                task_key: request.task_no,
                name: request.name,
                initial_command: request.initial_command.filter(|c| !c.is_empty()),
            })
            .map_err(|e| ErrorCode::SpawnFailed.with(format!("{e:#}")))
    }

    pub fn list_terminals_for_task(&self, task_key: &str) -> Vec<TerminalSummary> {
        self.registry.terminals_for_task(task_key)
    }

    pub fn status(&self, task_key: &str) -> TaskStatus {
        let session = self.registry.server_session(task_key);
        let status = self.registry.derive_status(task_key);
        let elapsed = session.as_ref().filter(|s| s.is_alive()).map(|s| s.uptime());
        TaskStatus {
            task_no: task_key.to_owned(),
            status,
            elapsed_secs: elapsed.map(|e| e.as_secs()),
            stalled: status == ServerStatus::Starting
                && elapsed.is_some_and(|e| e > self.settings.stall_threshold),
            pid: session.as_ref().filter(|s| s.is_alive()).and_then(|s| s.pid()),
            exit_code: session.as_ref().and_then(|s| s.phase().exit_code()),
            adopted_pid: self.adopted.lock().get(task_key).copied(),
        }
    }

    /// Status of every task in the worktree registry.
    pub fn statuses(&self) -> Result<Vec<TaskStatus>, ApiError> {
        let tasks = self.tasks.list_tasks().map_err(|e| ErrorCode::Internal.with(format!("{e:#}")))?;
        Ok(tasks.iter().map(|task| self.status(&task.task_no)).collect())
    }

    pub fn log_path(&self, task_key: &str) -> Result<PathBuf, ApiError> {
        validate_task_key(task_key)?;
        Ok(self.settings.log_dir.join(format!("{task_key}.log")))
    }

    /// Truncate the task's server log. Returns false if there was none.
    pub fn clear_log(&self, task_key: &str) -> Result<bool, ApiError> {
        let path = self.log_path(task_key)?;
        crate::logtail::truncate(&path).map_err(|e| ErrorCode::Internal.with(format!("{e:#}")))
    }

    fn find_task(&self, task_key: &str) -> Result<TaskRecord, ApiError> {
        self.tasks
            .find_task(task_key)
            .map_err(|e| ErrorCode::Internal.with(format!("{e:#}")))?
            .ok_or_else(|| ErrorCode::TaskNotFound.with(format!("task {task_key} not found")))
    }

    /// First listener on `port` that is neither this process nor a tracked
    /// session. Lookup failures count as no listener.
    async fn find_orphan(&self, port: u16) -> Option<u32> {
        let pids = match self.ports.listeners(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port, err = %e, "port lookup failed");
                return None;
            }
        };
        let own_pid = std::process::id();
        let tracked = self.registry.tracked_pids();
        pids.into_iter().find(|pid| *pid != own_pid && !tracked.contains(pid))
    }

    fn bootstrap_command(&self, task: &TaskRecord) -> String {
        let command = task.command.clone().unwrap_or_else(|| self.settings.dev_command.clone());
        if task.path.join("node_modules").exists() || self.settings.install_command.is_empty() {
            command
        } else {
            info!(task = %task.task_no, "node_modules missing; installing first");
            format!("{} && {command}", self.settings.install_command)
        }
    }
}

/// Task keys end up in file names and session ids.
fn validate_task_key(task_key: &str) -> Result<(), ApiError> {
    let valid = !task_key.is_empty()
        && task_key != "."
        && task_key != ".."
        && !task_key.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(ErrorCode::BadRequest.with(format!("invalid task key: {task_key:?}")))
    }
}

fn default_cwd() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
