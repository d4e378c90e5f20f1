// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod master;
pub mod spawn;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Variables a server process may inherit from the manager.
pub const ALLOWED_ENV: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR"];

/// Capacity of the per-process event channel.
pub const EVENT_CHANNEL: usize = 256;

/// Which parts of the manager's environment reach the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvPolicy {
    /// Pass the full ambient environment.
    Inherit,
    /// Pass only [`ALLOWED_ENV`].
    AllowList,
}

impl EnvPolicy {
    pub fn permits(&self, name: &str) -> bool {
        match self {
            Self::Inherit => true,
            Self::AllowList => ALLOWED_ENV.contains(&name),
        }
    }
}

/// Everything needed to start a PTY-backed process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: EnvPolicy,
    pub cols: u16,
    pub rows: u16,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    /// Shell-style exit code: the process code, or `128 + signal`.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

/// Output and exit notifications from a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Bytes),
    /// Sent exactly once, after the last `Output`.
    Exited(ExitStatus),
}

/// Control surface of a spawned process.
///
/// Every method is safe to call after the process has exited.
pub trait ProcessHandle: Send + Sync + 'static {
    fn write(&self, data: Bytes);

    fn resize(&self, cols: u16, rows: u16);

    /// Request termination. Only the first call has an effect.
    fn kill(&self);

    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process and its event stream.
pub struct Spawned {
    pub handle: Arc<dyn ProcessHandle>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Creates PTY-backed processes. Object-safe for `Arc<dyn Spawner>`.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<Spawned>;
}
