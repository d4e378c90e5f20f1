// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background reconciliation of server sessions against readiness probes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ports::BoxFuture;
use crate::session::registry::SessionRegistry;
use crate::worktree::TaskDirectory;

/// Checks whether something answers HTTP on a local port.
pub trait ReadinessProbe: Send + Sync + 'static {
    /// Resolve with the response status. Any response counts as ready.
    fn probe(&self, port: u16, path: &str) -> BoxFuture<'_, anyhow::Result<u16>>;
}

/// HTTP probe that never follows redirects.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("build probe client")?;
        Ok(Self { client })
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe(&self, port: u16, path: &str) -> BoxFuture<'_, anyhow::Result<u16>> {
        let url = format!("http://localhost:{port}{path}");
        Box::pin(async move {
            let resp = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
            Ok(resp.status().as_u16())
        })
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub probed: usize,
    pub readied: Vec<String>,
    pub reaped: Vec<String>,
}

/// Components a reconciliation pass reads and mutates.
#[derive(Clone)]
pub struct Reconciler {
    pub registry: Arc<SessionRegistry>,
    pub tasks: Arc<dyn TaskDirectory>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub default_path: String,
}

impl Reconciler {
    /// Run one pass over every task that declares a port.
    ///
    /// Tasks without a server session are skipped without any network
    /// traffic. Probes run concurrently and each is bounded by its timeout.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let tasks = match self.tasks.list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(err = %e, "cannot list tasks for health check");
                return report;
            }
        };

        let mut probes = Vec::new();
        for task in tasks {
            let Some(port) = task.effective_port() else {
                continue;
            };
            let Some(session) = self.registry.server_session(&task.task_no) else {
                continue;
            };
            if !session.is_alive() {
                self.registry.destroy_session(&session);
                report.reaped.push(task.task_no);
                continue;
            }
            if session.is_ready() {
                continue;
            }
            let path = task.health_check_path.unwrap_or_else(|| self.default_path.clone());
            let probe = Arc::clone(&self.probe);
            probes.push(async move {
                let result = probe.probe(port, &path).await;
                (task.task_no, session, result)
            });
        }

        report.probed = probes.len();
        for (task_key, session, result) in futures_util::future::join_all(probes).await {
            match result {
                Ok(status) => {
                    // The session may have been stopped or replaced mid-probe.
                    let current = self
                        .registry
                        .server_session(&task_key)
                        .is_some_and(|s| Arc::ptr_eq(&s, &session));
                    if current && self.registry.mark_ready(&task_key) {
                        debug!(task = %task_key, status, "readiness probe answered");
                        report.readied.push(task_key);
                    }
                }
                Err(e) => debug!(task = %task_key, err = %format!("{e:#}"), "readiness probe failed"),
            }
        }
        report
    }
}

/// Spawn the periodic reconciler. It stops when `shutdown` is cancelled.
pub fn spawn_health_checker(
    reconciler: Reconciler,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    info!(interval_ms = interval.as_millis() as u64, "starting health checker");
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let report = reconciler.reconcile_once().await;
            if !report.readied.is_empty() || !report.reaped.is_empty() {
                info!(readied = ?report.readied, reaped = ?report.reaped, "health check pass");
            }
        }
    })
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
