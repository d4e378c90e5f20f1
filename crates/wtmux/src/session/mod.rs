// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod frame;
pub mod registry;
pub mod viewer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pty::ProcessHandle;
use crate::ring::RingBuffer;
use frame::ControlFrame;
use viewer::{Outbound, ViewerSink};

const SERVER_PREFIX: &str = "server-";

/// Session id of the dev server for `task_key`.
pub fn server_session_id(task_key: &str) -> String {
    format!("{SERVER_PREFIX}{task_key}")
}

/// Whether `id` is reserved for server sessions.
pub fn is_server_session_id(id: &str) -> bool {
    id.starts_with(SERVER_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Interactive shell, reclaimed when abandoned.
    Terminal,
    /// Dev server, controlled only through start/stop.
    Server,
}

/// Server status derived from a session's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
}

/// Lifecycle of one session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Process running, readiness not yet confirmed.
    Spawned,
    /// Process running and a readiness probe succeeded.
    Ready,
    Exited { code: i32 },
}

impl Phase {
    /// Spawned becomes Ready; every other phase is unchanged.
    pub fn mark_ready(self) -> Self {
        match self {
            Self::Spawned => Self::Ready,
            other => other,
        }
    }

    /// The first exit wins; later exits are ignored.
    pub fn exit(self, code: i32) -> Self {
        match self {
            Self::Exited { .. } => self,
            Self::Spawned | Self::Ready => Self::Exited { code },
        }
    }

    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Exited { .. })
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn status(self) -> ServerStatus {
        match self {
            Self::Spawned => ServerStatus::Starting,
            Self::Ready => ServerStatus::Running,
            Self::Exited { .. } => ServerStatus::Stopped,
        }
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub task_key: Option<String>,
    pub name: Option<String>,
    pub alive: bool,
    pub ready: bool,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub viewers: usize,
    pub scrollback_bytes: usize,
}

/// Fixed attributes of a new session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub kind: SessionKind,
    pub task_key: Option<String>,
    pub name: Option<String>,
}

/// One tracked PTY process with its scrollback and viewers.
pub struct Session {
    meta: SessionMeta,
    created_at: Instant,
    process: Arc<dyn ProcessHandle>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    scrollback: RingBuffer,
    viewers: Vec<ViewerSink>,
    phase: Phase,
    cleanup: Option<CleanupTimer>,
    cleanup_generation: u64,
    destroyed: bool,
}

struct CleanupTimer {
    generation: u64,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(meta: SessionMeta, process: Arc<dyn ProcessHandle>, scrollback_cap: usize) -> Self {
        Self {
            meta,
            created_at: Instant::now(),
            process,
            inner: Mutex::new(SessionInner {
                scrollback: RingBuffer::new(scrollback_cap),
                viewers: Vec::new(),
                phase: Phase::Spawned,
                cleanup: None,
                cleanup_generation: 0,
                destroyed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn kind(&self) -> SessionKind {
        self.meta.kind
    }

    pub fn task_key(&self) -> Option<&str> {
        self.meta.task_key.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.meta.name.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn is_alive(&self) -> bool {
        self.phase().is_alive()
    }

    pub fn is_ready(&self) -> bool {
        self.phase().is_ready()
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.lock().viewers.len()
    }

    pub fn has_cleanup_pending(&self) -> bool {
        self.inner.lock().cleanup.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    pub fn scrollback(&self) -> Vec<u8> {
        self.inner.lock().scrollback.snapshot()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            id: self.meta.id.clone(),
            kind: self.meta.kind,
            task_key: self.meta.task_key.clone(),
            name: self.meta.name.clone(),
            alive: inner.phase.is_alive(),
            ready: inner.phase.is_ready(),
            exit_code: inner.phase.exit_code(),
            pid: self.process.pid(),
            uptime_secs: self.created_at.elapsed().as_secs(),
            viewers: inner.viewers.len(),
            scrollback_bytes: inner.scrollback.len(),
        }
    }

    /// Forward viewer input to the process.
    pub fn write(&self, data: Bytes) {
        self.process.write(data);
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.process.resize(cols, rows);
    }

    pub fn clear_scrollback(&self) {
        self.inner.lock().scrollback.clear();
    }

    /// Append process output to scrollback and fan it out to every viewer.
    ///
    /// Viewers that cannot take the chunk are dropped.
    pub fn push_output(&self, data: Bytes) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.scrollback.write(&data);
        let before = inner.viewers.len();
        inner.viewers.retain(|viewer| viewer.offer(Outbound::Data(data.clone())));
        let dropped = before - inner.viewers.len();
        if dropped > 0 {
            debug!(session_id = %self.meta.id, dropped, "dropped slow or closed viewers");
        }
    }

    /// Record the process exit and notify viewers. Returns false if the
    /// session had already exited.
    pub fn mark_exited(&self, code: i32) -> bool {
        let mut inner = self.inner.lock();
        if !inner.phase.is_alive() {
            return false;
        }
        inner.phase = inner.phase.exit(code);
        let frame = Outbound::Control(ControlFrame::Exit { code });
        inner.viewers.retain(|viewer| viewer.offer(frame.clone()));
        if inner.destroyed {
            // Nothing more will be sent; closing the queues ends the streams.
            inner.viewers.clear();
        }
        true
    }

    /// Set ready on a live, not-yet-ready session.
    pub fn mark_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        let next = inner.phase.mark_ready();
        let changed = next != inner.phase;
        inner.phase = next;
        changed
    }

    /// Add a viewer, replaying scrollback to it alone.
    ///
    /// Returns false if the session has been destroyed.
    pub fn attach(&self, viewer: ViewerSink) -> bool {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return false;
        }
        if let Some(timer) = inner.cleanup.take() {
            timer.cancel.cancel();
        }
        if !inner.scrollback.is_empty() {
            viewer.offer(Outbound::Control(ControlFrame::Replay));
            viewer.offer(Outbound::Data(Bytes::from(inner.scrollback.snapshot())));
        }
        if let Some(code) = inner.phase.exit_code() {
            viewer.offer(Outbound::Control(ControlFrame::Exit { code }));
        }
        inner.viewers.push(viewer);
        true
    }

    /// Remove a viewer by id and return how many remain.
    pub fn detach(&self, viewer_id: u64) -> usize {
        let mut inner = self.inner.lock();
        inner.viewers.retain(|viewer| viewer.id() != viewer_id);
        inner.viewers.len()
    }

    /// Arm a fresh cleanup timer, replacing any pending one.
    ///
    /// Returns the generation to claim later, or `None` once destroyed.
    pub(crate) fn arm_cleanup(&self) -> Option<(u64, CancellationToken)> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return None;
        }
        if let Some(old) = inner.cleanup.take() {
            old.cancel.cancel();
        }
        inner.cleanup_generation += 1;
        let generation = inner.cleanup_generation;
        let cancel = CancellationToken::new();
        inner.cleanup = Some(CleanupTimer { generation, cancel: cancel.clone() });
        Some((generation, cancel))
    }

    /// Take the pending cleanup if it is still the one armed as `generation`.
    pub(crate) fn claim_cleanup(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.cleanup.as_ref().is_some_and(|timer| timer.generation == generation);
        if current {
            inner.cleanup = None;
        }
        current
    }

    /// Mark destroyed, cancel cleanup and kill the process if alive.
    ///
    /// Returns false if the session was already destroyed.
    pub(crate) fn terminate(&self) -> bool {
        let alive = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return false;
            }
            inner.destroyed = true;
            if let Some(timer) = inner.cleanup.take() {
                timer.cancel.cancel();
            }
            let alive = inner.phase.is_alive();
            if !alive {
                inner.viewers.clear();
            }
            alive
        };
        if alive {
            self.process.kill();
        }
        true
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
