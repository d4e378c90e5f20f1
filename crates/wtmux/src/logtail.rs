// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What a poll of the log file found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// Bytes appended since the last poll.
    Data(Bytes),
    /// The file shrank; reading restarts from the beginning.
    Cleared,
    /// The file does not exist. Reported once per absence.
    NoFile,
}

/// Requests from the viewer side of a tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailCommand {
    /// Truncate the file and restart from offset zero.
    Clear,
}

/// Follows an append-only log file by byte offset.
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    missing: bool,
    poll_interval: Duration,
}

impl LogTail {
    /// Open a tail that first delivers at most `backlog` trailing bytes.
    pub fn open(path: PathBuf, backlog: u64) -> Self {
        let offset = match std::fs::metadata(&path) {
            Ok(meta) => meta.len().saturating_sub(backlog),
            Err(_) => 0,
        };
        Self { path, offset, missing: false, poll_interval: Duration::from_secs(1) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once.
    pub fn poll(&mut self) -> anyhow::Result<Option<TailEvent>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.offset = 0;
                if self.missing {
                    return Ok(None);
                }
                self.missing = true;
                return Ok(Some(TailEvent::NoFile));
            }
            Err(e) => return Err(e).with_context(|| format!("open {}", self.path.display())),
        };
        self.missing = false;

        let len = file.metadata()?.len();
        if len < self.offset {
            self.offset = 0;
            return Ok(Some(TailEvent::Cleared));
        }
        if len == self.offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }
        self.offset += buf.len() as u64;
        Ok(Some(TailEvent::Data(Bytes::from(buf))))
    }

    /// Truncate the file and reset the cursor.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        truncate(&self.path)?;
        self.offset = 0;
        Ok(())
    }

    /// Follow the file, sending events until shutdown or until either
    /// channel closes.
    ///
    /// Wakes on `notify` events for the parent directory and on a polling
    /// interval as a fallback.
    pub async fn run(
        mut self,
        events: mpsc::Sender<TailEvent>,
        mut commands: mpsc::Receiver<TailCommand>,
        shutdown: CancellationToken,
    ) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);
        let mut poll_interval = tokio::time::interval(self.poll_interval);

        loop {
            match self.poll() {
                Ok(Some(event)) => {
                    if events.send(event).await.is_err() {
                        break;
                    }
                    // More may be pending (e.g. data right after a reset).
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(path = %self.path.display(), err = %e, "log tail read failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll_interval.tick() => {}
                command = commands.recv() => match command {
                    Some(TailCommand::Clear) => match self.clear() {
                        Ok(()) => {
                            if events.send(TailEvent::Cleared).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(path = %self.path.display(), err = %e, "log clear failed"),
                    },
                    None => break,
                },
            }
        }
    }

    /// Watch the parent directory so creation and truncation are seen too.
    fn setup_notify_watcher(&self, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;
        let watch_path = self.path.parent().unwrap_or(self.path.as_path());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    }
}

/// Truncate `path` to zero length. Returns false if it does not exist.
pub fn truncate(path: &Path) -> anyhow::Result<bool> {
    match std::fs::OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("truncate {}", path.display())),
    }
}

#[cfg(test)]
#[path = "logtail_tests.rs"]
mod tests;
