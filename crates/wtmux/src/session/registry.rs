// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::viewer::ViewerSink;
use super::{server_session_id, ServerStatus, Session, SessionInfo, SessionKind, SessionMeta};
use crate::config::Config;
use crate::pty::{EnvPolicy, ProcessEvent, SpawnSpec, Spawned, Spawner};

/// Registry-wide spawn and retention settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_bytes: usize,
    pub orphan_timeout: Duration,
    /// Server output is appended to `<log_dir>/<task>.log` when set.
    pub log_dir: Option<PathBuf>,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.shell.clone(),
            cols: config.cols,
            rows: config.rows,
            scrollback_bytes: config.scrollback_bytes,
            orphan_timeout: config.orphan_timeout(),
            log_dir: Some(config.log_dir.clone()),
        }
    }
}

/// Parameters for [`SessionRegistry::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub id: String,
    pub kind: SessionKind,
    pub cwd: PathBuf,
    pub task_key: Option<String>,
    pub name: Option<String>,
    /// Written to the shell once, followed by a newline.
    pub initial_command: Option<String>,
}

impl CreateOptions {
    pub fn terminal(id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind: SessionKind::Terminal,
            cwd: cwd.into(),
            task_key: None,
            name: None,
            initial_command: None,
        }
    }

    pub fn server(task_key: &str, cwd: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            id: server_session_id(task_key),
            kind: SessionKind::Server,
            cwd: cwd.into(),
            task_key: Some(task_key.to_owned()),
            name: None,
            initial_command: Some(command.into()),
        }
    }
}

/// A terminal tab belonging to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSummary {
    pub session_id: String,
    pub name: Option<String>,
    pub alive: bool,
}

/// Process-wide map of live sessions.
///
/// One instance is built at startup and shared by reference with every
/// component that needs sessions; it lives until the manager exits.
pub struct SessionRegistry {
    me: Weak<SessionRegistry>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    spawner: Arc<dyn Spawner>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(spawner: Arc<dyn Spawner>, settings: RegistrySettings) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sessions: RwLock::new(HashMap::new()),
            spawner,
            settings,
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Spawn a session, superseding any session with the same id.
    ///
    /// A failed spawn leaves the registry without an entry for the id.
    pub fn create(&self, opts: CreateOptions) -> anyhow::Result<Arc<Session>> {
        if let Some(previous) = self.get(&opts.id) {
            debug!(session_id = %opts.id, "superseding session");
            self.destroy_session(&previous);
        }

        let spec = SpawnSpec {
            shell: self.settings.shell.clone(),
            cwd: opts.cwd.clone(),
            env: match opts.kind {
                SessionKind::Terminal => EnvPolicy::Inherit,
                SessionKind::Server => EnvPolicy::AllowList,
            },
            cols: self.settings.cols,
            rows: self.settings.rows,
        };
        let Spawned { handle, events } = self
            .spawner
            .spawn(&spec)
            .with_context(|| format!("spawn {} in {}", spec.shell, spec.cwd.display()))?;

        let meta = SessionMeta {
            id: opts.id.clone(),
            kind: opts.kind,
            task_key: opts.task_key.clone(),
            name: opts.name.clone(),
        };
        let session = Arc::new(Session::new(meta, handle, self.settings.scrollback_bytes));

        let raced = self.sessions.write().insert(opts.id.clone(), Arc::clone(&session));
        if let Some(raced) = raced {
            raced.terminate();
        }

        if let Some(ref command) = opts.initial_command {
            session.write(Bytes::from(format!("{command}\n")));
        }

        let log_path = match (opts.kind, &opts.task_key, &self.settings.log_dir) {
            (SessionKind::Server, Some(task), Some(dir)) => Some(dir.join(format!("{task}.log"))),
            _ => None,
        };
        tokio::spawn(pump(self.me.clone(), Arc::clone(&session), events, log_path));

        if session.kind() == SessionKind::Terminal {
            self.schedule_cleanup(&session);
        }

        info!(
            session_id = %opts.id,
            kind = ?opts.kind,
            task = opts.task_key.as_deref().unwrap_or(""),
            pid = session.pid().unwrap_or(0),
            "created session"
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// The server session for `task_key`, if one exists.
    pub fn server_session(&self, task_key: &str) -> Option<Arc<Session>> {
        self.get(&server_session_id(task_key))
    }

    /// Destroy the session at `id`. Returns false if there was none.
    pub fn destroy(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                self.destroy_session(&session);
                true
            }
            None => false,
        }
    }

    /// Destroy this exact session instance.
    ///
    /// The map entry is only removed if it still points at `session`, so a
    /// stale caller cannot remove its replacement.
    pub fn destroy_session(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.sessions.write();
            if sessions.get(session.id()).is_some_and(|current| Arc::ptr_eq(current, session)) {
                sessions.remove(session.id());
            }
        }
        if session.terminate() {
            info!(session_id = %session.id(), "destroyed session");
        }
    }

    /// Attach a viewer to `id`. Returns the session, or `None` if absent.
    pub fn attach_viewer(&self, id: &str, viewer: ViewerSink) -> Option<Arc<Session>> {
        let session = self.get(id)?;
        if !session.attach(viewer) {
            return None;
        }
        debug!(session_id = %id, viewers = session.viewer_count(), "viewer attached");
        Some(session)
    }

    /// Detach a viewer; an abandoned terminal gets its cleanup timer armed.
    pub fn detach_viewer(&self, session: &Arc<Session>, viewer_id: u64) {
        let remaining = session.detach(viewer_id);
        debug!(session_id = %session.id(), viewers = remaining, "viewer detached");
        if remaining == 0 && session.kind() == SessionKind::Terminal {
            self.schedule_cleanup(session);
        }
    }

    pub fn derive_status(&self, task_key: &str) -> ServerStatus {
        self.server_session(task_key).map_or(ServerStatus::Stopped, |s| s.phase().status())
    }

    /// Mark the task's live server ready. Returns true if it changed.
    pub fn mark_ready(&self, task_key: &str) -> bool {
        let Some(session) = self.server_session(task_key) else {
            return false;
        };
        let changed = session.mark_ready();
        if changed {
            info!(task = %task_key, session_id = %session.id(), "server ready");
        }
        changed
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn terminals_for_task(&self, task_key: &str) -> Vec<TerminalSummary> {
        let mut terminals: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.kind() == SessionKind::Terminal && s.task_key() == Some(task_key))
            .map(|s| TerminalSummary {
                session_id: s.id().to_owned(),
                name: s.name().map(str::to_owned),
                alive: s.is_alive(),
            })
            .collect();
        terminals.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        terminals
    }

    /// Pids of every live tracked process.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.sessions.read().values().filter(|s| s.is_alive()).filter_map(|s| s.pid()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every session. Used at shutdown.
    pub fn destroy_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.terminate();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "destroyed all sessions");
        }
    }

    /// Arm the orphan timer of a terminal session.
    fn schedule_cleanup(&self, session: &Arc<Session>) {
        let Some((generation, cancel)) = session.arm_cleanup() else {
            return;
        };
        let registry = self.me.clone();
        let target = Arc::downgrade(session);
        let timeout = self.settings.orphan_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let (Some(registry), Some(session)) = (registry.upgrade(), target.upgrade())
                    else {
                        return;
                    };
                    if session.claim_cleanup(generation) {
                        info!(session_id = %session.id(), "reclaiming abandoned terminal");
                        registry.destroy_session(&session);
                    }
                }
            }
        });
    }
}

/// Relay process events into the session until the process exits.
async fn pump(
    registry: Weak<SessionRegistry>,
    session: Arc<Session>,
    mut events: mpsc::Receiver<ProcessEvent>,
    log_path: Option<PathBuf>,
) {
    let mut log = match log_path {
        Some(path) => open_log(&path).await,
        None => None,
    };

    let mut exit_code = -1;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(data) => {
                session.push_output(data.clone());
                if let Some(file) = log.as_mut() {
                    if let Err(e) = file.write_all(&data).await {
                        warn!(session_id = %session.id(), err = %e, "server log write failed");
                        log = None;
                    }
                }
            }
            ProcessEvent::Exited(status) => {
                exit_code = status.exit_code();
                break;
            }
        }
    }

    if !session.mark_exited(exit_code) {
        return;
    }
    info!(
        session_id = %session.id(),
        code = exit_code,
        uptime_secs = session.uptime().as_secs(),
        "session process exited"
    );
    if session.kind() == SessionKind::Terminal {
        if let Some(registry) = registry.upgrade() {
            registry.schedule_cleanup(&session);
        }
    }
}

async fn open_log(path: &std::path::Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %path.display(), err = %e, "cannot create log directory");
            return None;
        }
    }
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "cannot open server log");
            None
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
