// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::errno::Errno;
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::master::{is_hangup, Master};
use super::{ExitStatus, ProcessEvent, ProcessHandle, SpawnSpec, Spawned, Spawner, EVENT_CHANNEL};

/// Spawns real processes on a fresh PTY via `forkpty`.
pub struct NativeSpawner {
    kill_grace: Duration,
}

impl NativeSpawner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Spawner for NativeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<Spawned> {
        let (process, pump) = NativeProcess::start(spec, self.kill_grace)?;
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL);
        let reaped = Arc::clone(&process.reaped);
        tokio::spawn(pump.run(events_tx, reaped));
        Ok(Spawned { handle: Arc::new(process), events })
    }
}

enum Command {
    Write(Bytes),
    Resize(u16, u16),
}

/// Handle to a forked PTY child.
pub struct NativeProcess {
    pid: Pid,
    commands: mpsc::UnboundedSender<Command>,
    killed: AtomicBool,
    reaped: Arc<AtomicBool>,
    kill_grace: Duration,
}

/// Owns the master fd and drives I/O until the child is reaped.
struct Pump {
    master: Master,
    pid: Pid,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl NativeProcess {
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    fn start(spec: &SpawnSpec, kill_grace: Duration) -> anyhow::Result<(Self, Pump)> {
        if !spec.cwd.is_dir() {
            bail!("working directory does not exist: {}", spec.cwd.display());
        }
        // Everything the child needs is prepared before the fork.
        let shell = CString::new(spec.shell.as_bytes()).context("invalid shell path")?;
        let cwd = spec.cwd.clone();
        let stripped: Vec<_> = std::env::vars_os()
            .map(|(key, _)| key)
            .filter(|key| !key.to_str().is_some_and(|k| spec.env.permits(k)))
            .collect();

        let winsize = Winsize { ws_col: spec.cols, ws_row: spec.rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                // SAFETY: restoring signal disposition in the post-fork child
                // before exec. Tokio leaves SIGPIPE ignored.
                unsafe {
                    let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl);
                }
                for key in &stripped {
                    std::env::remove_var(key);
                }
                std::env::set_var("TERM", "xterm-256color");
                let _ = nix::unistd::chdir(&cwd);
                let _ = execvp(&shell, std::slice::from_ref(&shell));
                // SAFETY: exec failed; leave without running the parent's
                // destructors or atexit handlers.
                unsafe { libc::_exit(127) }
            }
            ForkptyResult::Parent { child, master } => {
                let master = Master::new(master).context("register PTY master")?;
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                debug!(pid = child.as_raw(), shell = %spec.shell, "spawned pty process");
                Ok((
                    Self {
                        pid: child,
                        commands: commands_tx,
                        killed: AtomicBool::new(false),
                        reaped: Arc::new(AtomicBool::new(false)),
                        kill_grace,
                    },
                    Pump { master, pid: child, commands: commands_rx },
                ))
            }
        }
    }

    /// forkpty calls setsid, so the child's pid is also its process group.
    fn signal_group(&self, signal: Signal) {
        signal_group(self.pid, signal);
    }
}

impl ProcessHandle for NativeProcess {
    fn write(&self, data: Bytes) {
        let _ = self.commands.send(Command::Write(data));
    }

    fn resize(&self, cols: u16, rows: u16) {
        let _ = self.commands.send(Command::Resize(cols, rows));
    }

    fn kill(&self) {
        if self.reaped.load(Ordering::Acquire) || self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal_group(Signal::SIGHUP);

        let pid = self.pid;
        let reaped = Arc::clone(&self.reaped);
        let grace = self.kill_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if !reaped.load(Ordering::Acquire) {
                        debug!(pid = pid.as_raw(), "escalating to SIGKILL");
                        signal_group(pid, Signal::SIGKILL);
                    }
                });
            }
            Err(_) => signal_group(pid, Signal::SIGKILL),
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid.as_raw() as u32)
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

impl Pump {
    async fn run(mut self, events: mpsc::Sender<ProcessEvent>, reaped: Arc<AtomicBool>) {
        let mut buf = vec![0u8; 8192];
        let mut commands_open = true;

        loop {
            tokio::select! {
                result = self.master.read(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if events.send(ProcessEvent::Output(data)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) if is_hangup(&e) => break,
                        Err(e) => {
                            warn!(pid = self.pid.as_raw(), err = %e, "pty read failed");
                            break;
                        }
                    }
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(Command::Write(data)) => {
                            if let Err(e) = self.master.write_all(&data).await {
                                if is_hangup(&e) {
                                    break;
                                }
                                warn!(pid = self.pid.as_raw(), err = %e, "pty write failed");
                            }
                        }
                        Some(Command::Resize(cols, rows)) => {
                            if let Err(e) = self.master.resize(cols, rows) {
                                debug!(pid = self.pid.as_raw(), err = %e, "pty resize failed");
                            }
                        }
                        None => commands_open = false,
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid blocking the runtime
        let pid = self.pid;
        let status = match tokio::task::spawn_blocking(move || wait_for_exit(pid)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(pid = pid.as_raw(), err = %e, "reap failed");
                ExitStatus { code: None, signal: None }
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), err = %e, "reap thread failed");
                ExitStatus { code: None, signal: None }
            }
        };
        reaped.store(true, Ordering::Release);
        debug!(pid = pid.as_raw(), code = status.exit_code(), "pty process exited");
        let _ = events.send(ProcessEvent::Exited(status)).await;
    }
}

fn signal_group(pid: Pid, signal: Signal) {
    match kill(Pid::from_raw(-pid.as_raw()), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid.as_raw(), signal = ?signal, err = %e, "signal failed"),
    }
}

/// Block until the child exits.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
