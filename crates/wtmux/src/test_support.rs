// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: fakes, builders, and assertion helpers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tokio_util::sync::CancellationToken;

use crate::health::{ReadinessProbe, Reconciler};
use crate::manager::{ManagerSettings, TaskManager};
use crate::ports::{BoxFuture, PortLookup};
use crate::pty::{
    ExitStatus, ProcessEvent, ProcessHandle, SpawnSpec, Spawned, Spawner, EVENT_CHANNEL,
};
use crate::session::registry::{RegistrySettings, SessionRegistry};
use crate::transport::state::{AppState, LogSettings};
use crate::worktree::{TaskDirectory, TaskRecord};

static NEXT_FAKE_PID: AtomicU32 = AtomicU32::new(40_000);

/// Spawner that hands out scripted in-memory processes.
#[derive(Default)]
pub struct FakeSpawner {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    failure: Mutex<Option<String>>,
    echo: AtomicBool,
    spawns: AtomicUsize,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processes created from now on echo their input as output.
    pub fn echoing() -> Arc<Self> {
        let spawner = Self::default();
        spawner.echo.store(true, Ordering::Relaxed);
        Arc::new(spawner)
    }

    /// Make every following spawn fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn process(&self, index: usize) -> Option<Arc<FakeProcess>> {
        self.processes.lock().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.processes.lock().last().cloned()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<Spawned> {
        if let Some(ref message) = *self.failure.lock() {
            anyhow::bail!("{message}");
        }
        let (tx, events) = mpsc::channel(EVENT_CHANNEL);
        let process = Arc::new(FakeProcess {
            pid: NEXT_FAKE_PID.fetch_add(1, Ordering::Relaxed),
            spec: spec.clone(),
            events: tx,
            echo: self.echo.load(Ordering::Relaxed),
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
        });
        self.processes.lock().push(Arc::clone(&process));
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Spawned { handle: process, events })
    }
}

/// In-memory process driven from tests.
pub struct FakeProcess {
    pid: u32,
    spec: SpawnSpec,
    events: mpsc::Sender<ProcessEvent>,
    echo: bool,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    kills: AtomicUsize,
    exited: AtomicBool,
}

impl FakeProcess {
    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Emit output as if the process printed it.
    pub fn emit(&self, data: &[u8]) {
        if !self.exited.load(Ordering::SeqCst) {
            let _ = self.events.try_send(ProcessEvent::Output(Bytes::copy_from_slice(data)));
        }
    }

    /// Exit with `code`. Only the first exit is reported.
    pub fn exit(&self, code: i32) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events.try_send(ProcessEvent::Exited(ExitStatus::exited(code)));
        }
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for FakeProcess {
    fn write(&self, data: Bytes) {
        self.written.lock().extend_from_slice(&data);
        if self.echo {
            self.emit(&data);
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        self.resizes.lock().push((cols, rows));
    }

    fn kill(&self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        self.kills.fetch_add(1, Ordering::SeqCst);
        // SIGHUP
        self.exit(129);
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

/// Fixed task list.
#[derive(Default)]
pub struct StaticTasks {
    tasks: Mutex<Vec<TaskRecord>>,
}

impl StaticTasks {
    pub fn new(tasks: Vec<TaskRecord>) -> Arc<Self> {
        Arc::new(Self { tasks: Mutex::new(tasks) })
    }

    pub fn set(&self, tasks: Vec<TaskRecord>) {
        *self.tasks.lock() = tasks;
    }
}

impl TaskDirectory for StaticTasks {
    fn list_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.tasks.lock().clone())
    }
}

/// A task record rooted at `path`.
pub fn task(task_no: &str, path: impl Into<PathBuf>, port: Option<u16>) -> TaskRecord {
    TaskRecord {
        task_no: task_no.to_owned(),
        path: path.into(),
        port,
        health_check_path: None,
        command: None,
    }
}

/// Port lookup answering from a table; records terminated pids.
#[derive(Default)]
pub struct StaticPorts {
    listeners: Mutex<HashMap<u16, Vec<u32>>>,
    terminated: Mutex<Vec<u32>>,
    lookups: AtomicUsize,
}

impl StaticPorts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listen(&self, port: u16, pids: &[u32]) {
        self.listeners.lock().insert(port, pids.to_vec());
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl PortLookup for StaticPorts {
    fn listeners(&self, port: u16) -> BoxFuture<'_, anyhow::Result<Vec<u32>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let pids = self.listeners.lock().get(&port).cloned().unwrap_or_default();
        Box::pin(async move { Ok(pids) })
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        self.terminated.lock().push(pid);
        let mut listeners = self.listeners.lock();
        for pids in listeners.values_mut() {
            pids.retain(|p| *p != pid);
        }
        Ok(())
    }
}

/// Probe with a canned answer: `Some(status)` responds, `None` refuses.
#[derive(Default)]
pub struct StaticProbe {
    answer: Mutex<Option<u16>>,
    probes: AtomicUsize,
}

impl StaticProbe {
    pub fn new(answer: Option<u16>) -> Arc<Self> {
        Arc::new(Self { answer: Mutex::new(answer), probes: AtomicUsize::new(0) })
    }

    pub fn set(&self, answer: Option<u16>) {
        *self.answer.lock() = answer;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl ReadinessProbe for StaticProbe {
    fn probe(&self, port: u16, _path: &str) -> BoxFuture<'_, anyhow::Result<u16>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let answer = *self.answer.lock();
        Box::pin(async move {
            answer.ok_or_else(|| anyhow::anyhow!("connection refused on port {port}"))
        })
    }
}

/// Builder for an [`AppState`] wired to fakes.
pub struct AppStateBuilder {
    spawner: Arc<FakeSpawner>,
    tasks: Arc<StaticTasks>,
    ports: Arc<StaticPorts>,
    probe: Arc<StaticProbe>,
    settings: RegistrySettings,
    log_dir: PathBuf,
    log_poll: Duration,
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            spawner: FakeSpawner::new(),
            tasks: StaticTasks::new(Vec::new()),
            ports: StaticPorts::new(),
            probe: StaticProbe::new(None),
            settings: test_settings(),
            log_dir: std::env::temp_dir().join("wtmux-test-logs"),
            log_poll: Duration::from_millis(20),
        }
    }

    pub fn spawner(mut self, spawner: Arc<FakeSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn tasks(mut self, tasks: Arc<StaticTasks>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn ports(mut self, ports: Arc<StaticPorts>) -> Self {
        self.ports = ports;
        self
    }

    pub fn probe(mut self, probe: Arc<StaticProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Directory for server logs; also enables writing them.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self.settings.log_dir = Some(self.log_dir.clone());
        self
    }

    pub fn orphan_timeout(mut self, timeout: Duration) -> Self {
        self.settings.orphan_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<AppState> {
        let backlog = self.settings.scrollback_bytes as u64;
        let registry = SessionRegistry::new(self.spawner, self.settings);
        let manager = Arc::new(TaskManager::new(
            Arc::clone(&registry),
            self.tasks.clone(),
            self.ports,
            ManagerSettings {
                dev_command: "npm run dev".to_owned(),
                install_command: "npm install".to_owned(),
                stall_threshold: Duration::from_secs(60),
                log_dir: self.log_dir,
            },
        ));
        let reconciler = Reconciler {
            registry: Arc::clone(&registry),
            tasks: self.tasks,
            probe: self.probe,
            default_path: "/".to_owned(),
        };
        Arc::new(AppState {
            registry,
            manager,
            reconciler,
            logs: LogSettings { poll_interval: self.log_poll, backlog_bytes: backlog },
            shutdown: CancellationToken::new(),
        })
    }
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_http_server(
    state: Arc<AppState>,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = crate::transport::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, handle))
}

/// Registry settings for tests: small scrollback, no server log files.
pub fn test_settings() -> RegistrySettings {
    RegistrySettings {
        shell: "/bin/sh".to_owned(),
        cols: 80,
        rows: 24,
        scrollback_bytes: 1024,
        orphan_timeout: Duration::from_secs(300),
        log_dir: None,
    }
}

pub fn test_registry(spawner: Arc<FakeSpawner>) -> Arc<SessionRegistry> {
    SessionRegistry::new(spawner, test_settings())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Converts `Result<T, E: Display>` into `anyhow::Result<T>`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// Assert that `$expr` is an `Err` whose message contains `$substr`.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let Err(err) = result else {
            panic!(concat!("expected Err for: ", stringify!($expr)));
        };
        let msg = format!("{err:#}");
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
