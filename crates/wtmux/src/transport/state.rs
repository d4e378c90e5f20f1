// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::health::{HttpProbe, Reconciler};
use crate::manager::{ManagerSettings, TaskManager};
use crate::ports::LsofLookup;
use crate::pty::spawn::NativeSpawner;
use crate::session::registry::{RegistrySettings, SessionRegistry};
use crate::worktree::JsonTaskStore;

/// Shared application state passed to all handlers via axum `State` extractor.
///
/// Exactly one instance exists per server process. It is built once at
/// startup and outlives every connection; the session registry inside it
/// is the only owner of live sessions.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub manager: Arc<TaskManager>,
    pub reconciler: Reconciler,
    pub logs: LogSettings,
    /// Cancelled once at shutdown; connection loops and tails stop on it.
    pub shutdown: CancellationToken,
}

/// How `/ws/logs` tails server log files.
#[derive(Debug, Clone, Copy)]
pub struct LogSettings {
    pub poll_interval: Duration,
    /// Trailing bytes delivered when a tail opens.
    pub backlog_bytes: u64,
}

impl AppState {
    /// Wire the native process, port and probe backends from `config`.
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let spawner = Arc::new(NativeSpawner::new(config.kill_grace()));
        let registry = SessionRegistry::new(spawner, RegistrySettings::from_config(config));
        let tasks = Arc::new(JsonTaskStore::new(config.tasks_file.clone()));
        let ports = Arc::new(LsofLookup::new(config.port_lookup_timeout()));
        let probe = Arc::new(HttpProbe::new(config.probe_timeout())?);

        let manager = Arc::new(TaskManager::new(
            Arc::clone(&registry),
            tasks.clone(),
            ports,
            ManagerSettings::from_config(config),
        ));
        let reconciler = Reconciler {
            registry: Arc::clone(&registry),
            tasks,
            probe,
            default_path: config.health_check_path.clone(),
        };

        Ok(Self {
            registry,
            manager,
            reconciler,
            logs: LogSettings {
                poll_interval: config.log_poll_interval(),
                backlog_bytes: config.scrollback_bytes as u64,
            },
            shutdown,
        })
    }
}
