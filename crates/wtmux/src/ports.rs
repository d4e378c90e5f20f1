// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS-level port ownership lookups.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Finds and signals the processes listening on a TCP port.
///
/// Object-safe for use as `Arc<dyn PortLookup>`.
pub trait PortLookup: Send + Sync + 'static {
    /// Pids listening on `port`, in the order the OS reports them.
    fn listeners(&self, port: u16) -> BoxFuture<'_, anyhow::Result<Vec<u32>>>;

    /// Send SIGTERM to `pid`. A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;
}

/// Port lookup backed by `lsof`.
pub struct LsofLookup {
    timeout: Duration,
}

impl LsofLookup {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PortLookup for LsofLookup {
    fn listeners(&self, port: u16) -> BoxFuture<'_, anyhow::Result<Vec<u32>>> {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new("lsof");
            cmd.args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"]).kill_on_drop(true);
            let output = tokio::time::timeout(self.timeout, cmd.output())
                .await
                .with_context(|| format!("lsof timed out for port {port}"))?
                .context("run lsof")?;
            // lsof exits non-zero when nothing matches.
            Ok(parse_pids(&String::from_utf8_lossy(&output.stdout)))
        })
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        let raw = i32::try_from(pid).with_context(|| format!("pid out of range: {pid}"))?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("SIGTERM {pid}")),
        }
    }
}

/// Parse `lsof -t` output: one pid per line, duplicates dropped.
pub fn parse_pids(text: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in text.lines().filter_map(|line| line.trim().parse::<u32>().ok()) {
        if pid != 0 && !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod tests;
