// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `wtmux` binary as a subprocess against a scratch
//! worktree registry and exercises it over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use wtmux::worktree::TaskRecord;

/// Resolve the path to the compiled `wtmux` binary.
pub fn wtmux_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("wtmux")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `wtmux` process that is killed on drop.
pub struct WtmuxProcess {
    child: Child,
    port: u16,
    scratch: tempfile::TempDir,
}

/// Builder for the registry and flags a [`WtmuxProcess`] starts with.
#[derive(Default)]
pub struct WtmuxBuilder {
    tasks: Vec<TaskRecord>,
    health_check_ms: Option<u64>,
}

impl WtmuxBuilder {
    /// Add a task to the worktree registry file.
    pub fn task(mut self, task: TaskRecord) -> Self {
        self.tasks.push(task);
        self
    }

    /// Reconciler interval (`--health-check-ms`).
    pub fn health_check_ms(mut self, ms: u64) -> Self {
        self.health_check_ms = Some(ms);
        self
    }

    pub fn spawn(self) -> anyhow::Result<WtmuxProcess> {
        let binary = wtmux_binary();
        anyhow::ensure!(binary.exists(), "wtmux binary not found at {}", binary.display());

        let scratch = tempfile::tempdir()?;
        let tasks_file = scratch.path().join("active.json");
        std::fs::write(&tasks_file, serde_json::to_vec(&self.tasks)?)?;
        let log_dir = scratch.path().join("logs");

        let port = free_port()?;
        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--shell".into(),
            "/bin/sh".into(),
            "--tasks-file".into(),
            tasks_file.to_string_lossy().into_owned(),
            "--log-dir".into(),
            log_dir.to_string_lossy().into_owned(),
            "--log-poll-ms".into(),
            "100".into(),
            "--kill-grace-ms".into(),
            "500".into(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        if let Some(ms) = self.health_check_ms {
            args.extend(["--health-check-ms".into(), ms.to_string()]);
        }

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(WtmuxProcess { child, port, scratch })
    }
}

impl WtmuxProcess {
    pub fn build() -> WtmuxBuilder {
        WtmuxBuilder::default()
    }

    /// Spawn with an empty worktree registry.
    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Scratch directory holding the registry file and logs.
    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    pub fn log_path(&self, task_no: &str) -> PathBuf {
        self.scratch.path().join("logs").join(format!("{task_no}.log"))
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Base URL for WebSocket connections.
    pub fn ws_base(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("wtmux did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for WtmuxProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
