// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Per-task terminal and dev-server session manager.
#[derive(Debug, Clone, Parser)]
#[command(name = "wtmux", version, about)]
pub struct Config {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "WTMUX_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000, env = "WTMUX_PORT")]
    pub port: u16,

    /// Program spawned inside every PTY.
    #[arg(long, env = "SHELL", default_value = "/bin/sh")]
    pub shell: String,

    /// Initial terminal width.
    #[arg(long, default_value_t = 120, env = "WTMUX_COLS")]
    pub cols: u16,

    /// Initial terminal height.
    #[arg(long, default_value_t = 30, env = "WTMUX_ROWS")]
    pub rows: u16,

    /// Scrollback cap per session, in bytes.
    #[arg(long, default_value_t = 100_000, env = "WTMUX_SCROLLBACK_BYTES")]
    pub scrollback_bytes: usize,

    /// How long a terminal with no viewers (or an exited one) survives.
    #[arg(long, default_value_t = 300_000, env = "WTMUX_ORPHAN_TIMEOUT_MS")]
    pub orphan_timeout_ms: u64,

    /// Health reconciler interval in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "WTMUX_HEALTH_CHECK_MS")]
    pub health_check_ms: u64,

    /// Probe path used when a task declares none.
    #[arg(long, default_value = "/", env = "WTMUX_HEALTH_CHECK_PATH")]
    pub health_check_path: String,

    /// Readiness probe timeout in milliseconds.
    #[arg(long, default_value_t = 3000, env = "WTMUX_PROBE_TIMEOUT_MS")]
    pub probe_timeout_ms: u64,

    /// Port owner lookup timeout in milliseconds.
    #[arg(long, default_value_t = 3000, env = "WTMUX_PORT_LOOKUP_TIMEOUT_MS")]
    pub port_lookup_timeout_ms: u64,

    /// Delay between SIGHUP and SIGKILL when killing a session.
    #[arg(long, default_value_t = 3000, env = "WTMUX_KILL_GRACE_MS")]
    pub kill_grace_ms: u64,

    /// Seconds in `starting` after which a server is reported as stalled.
    #[arg(long, default_value_t = 60, env = "WTMUX_STALL_SECS")]
    pub stall_secs: u64,

    /// Worktree registry file.
    #[arg(long, default_value = "work-trees/active.json", env = "WTMUX_TASKS_FILE")]
    pub tasks_file: PathBuf,

    /// Directory holding per-task server logs.
    #[arg(long, default_value = "work-trees/logs", env = "WTMUX_LOG_DIR")]
    pub log_dir: PathBuf,

    /// Bootstrap command for server sessions.
    #[arg(long, default_value = "npm run dev", env = "WTMUX_DEV_COMMAND")]
    pub dev_command: String,

    /// Prefixed to the bootstrap command when `node_modules` is missing.
    #[arg(long, default_value = "npm install", env = "WTMUX_INSTALL_COMMAND")]
    pub install_command: String,

    /// Log tail polling fallback in milliseconds.
    #[arg(long, default_value_t = 1000, env = "WTMUX_LOG_POLL_MS")]
    pub log_poll_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "WTMUX_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WTMUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the parsed flags.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("--cols and --rows must be non-zero");
        }
        if self.scrollback_bytes == 0 {
            anyhow::bail!("--scrollback-bytes must be non-zero");
        }
        let periods = [
            ("--health-check-ms", self.health_check_ms),
            ("--log-poll-ms", self.log_poll_ms),
            ("--probe-timeout-ms", self.probe_timeout_ms),
            ("--port-lookup-timeout-ms", self.port_lookup_timeout_ms),
        ];
        if let Some((flag, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            anyhow::bail!("{flag} must be non-zero");
        }
        if !self.health_check_path.starts_with('/') {
            anyhow::bail!("--health-check-path must start with '/'");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn port_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.port_lookup_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_secs)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }

    /// Build a config from defaults only, ignoring the environment.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            shell: "/bin/sh".to_owned(),
            cols: 120,
            rows: 30,
            scrollback_bytes: 100_000,
            orphan_timeout_ms: 300_000,
            health_check_ms: 10_000,
            health_check_path: "/".to_owned(),
            probe_timeout_ms: 3000,
            port_lookup_timeout_ms: 3000,
            kill_grace_ms: 3000,
            stall_secs: 60,
            tasks_file: PathBuf::from("work-trees/active.json"),
            log_dir: PathBuf::from("work-trees/logs"),
            dev_command: "npm run dev".to_owned(),
            install_command: "npm install".to_owned(),
            log_poll_ms: 1000,
            log_format: "text".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
