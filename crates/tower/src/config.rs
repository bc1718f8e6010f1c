// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ring::RING_MAX_LINES;
use crate::supervise::RestartPolicy;

/// Terminal multiplexer server for PTY-backed agent sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "towerd", version, about)]
pub struct Config {
    /// Host address to bind to.
    #[arg(long, env = "TOWER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP port to listen on (0 = ephemeral).
    #[arg(long, env = "TOWER_PORT", default_value = "4700")]
    pub port: u16,

    /// Data directory holding the session registry.
    #[arg(long, env = "TOWER_DATA_DIR", default_value = "/var/lib/tower")]
    pub data_dir: PathBuf,

    /// Sidecar socket directory. Kept short: Unix socket paths have a
    /// ~100-byte ceiling on some platforms.
    #[arg(long, env = "TOWER_SOCKET_DIR")]
    pub socket_dir_override: Option<PathBuf>,

    /// Path to the tower-sidecar binary (default: next to towerd).
    #[arg(long, env = "TOWER_SIDECAR_BIN")]
    pub sidecar_bin: Option<PathBuf>,

    /// Ring buffer bound per session, in lines.
    #[arg(long, env = "TOWER_RING_LINES", default_value_t = RING_MAX_LINES)]
    pub ring_lines: usize,

    /// Seconds to wait for a sidecar's announce line.
    #[arg(long, env = "TOWER_SPAWN_TIMEOUT", default_value = "5")]
    pub spawn_timeout_secs: u64,

    /// Per-row socket connect deadline during reconnection, in seconds.
    #[arg(long, env = "TOWER_CONNECT_TIMEOUT", default_value = "3")]
    pub connect_timeout_secs: u64,

    /// Grace between terminate and kill, in seconds.
    #[arg(long, env = "TOWER_KILL_GRACE", default_value = "3")]
    pub kill_grace_secs: u64,

    /// Bounded concurrency for the startup reconciliation pass.
    #[arg(long, env = "TOWER_RECONCILE_CONCURRENCY", default_value = "5")]
    pub reconcile_concurrency: usize,

    /// Stale-socket sweep interval in seconds (minimum 1).
    #[arg(long, env = "TOWER_SWEEP_INTERVAL", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Supervised restart cap within one stability window.
    #[arg(long, env = "TOWER_MAX_RESTARTS", default_value = "50")]
    pub max_restarts: u32,

    /// Supervised restart back-off in seconds.
    #[arg(long, env = "TOWER_RESTART_BACKOFF", default_value = "2")]
    pub restart_backoff_secs: u64,

    /// Stability window that clears the restart counter, in seconds.
    #[arg(long, env = "TOWER_RESTART_RESET", default_value = "300")]
    pub restart_reset_secs: u64,

    /// Send-buffer flusher period in milliseconds.
    #[arg(long, env = "TOWER_SENDBUF_FLUSH_MS", default_value = "500")]
    pub sendbuf_flush_ms: u64,

    /// Typing idle threshold before buffered messages deliver, in seconds.
    #[arg(long, env = "TOWER_SENDBUF_IDLE", default_value = "3")]
    pub sendbuf_idle_secs: u64,

    /// Maximum buffered-message age before forced delivery, in seconds.
    #[arg(long, env = "TOWER_SENDBUF_MAX_AGE", default_value = "60")]
    pub sendbuf_max_age_secs: u64,

    /// Directory for per-session terminal logs (disabled when unset).
    #[arg(long, env = "TOWER_SESSION_LOG_DIR")]
    pub session_log_dir: Option<PathBuf>,

    /// Byte cap per session terminal log file before rotation.
    #[arg(long, env = "TOWER_SESSION_LOG_CAP", default_value = "1048576")]
    pub session_log_cap: u64,

    /// Log format (json or text).
    #[arg(long, env = "TOWER_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TOWER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval_secs < 1 {
            anyhow::bail!("--sweep-interval must be at least 1 second");
        }
        if self.reconcile_concurrency == 0 {
            anyhow::bail!("--reconcile-concurrency must be non-zero");
        }
        if self.ring_lines == 0 {
            anyhow::bail!("--ring-lines must be non-zero");
        }
        if self.sendbuf_flush_ms == 0 {
            anyhow::bail!("--sendbuf-flush-ms must be non-zero");
        }
        Ok(())
    }

    /// The sidecar socket directory: per-user, short absolute path.
    pub fn socket_dir(&self) -> PathBuf {
        match self.socket_dir_override {
            Some(ref dir) => dir.clone(),
            None => {
                let uid = nix::unistd::Uid::current().as_raw();
                PathBuf::from(format!("/tmp/tower-{uid}"))
            }
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            backoff: Duration::from_secs(self.restart_backoff_secs),
            reset_window: Duration::from_secs(self.restart_reset_secs),
        }
    }

    pub fn sendbuf_flush(&self) -> Duration {
        Duration::from_millis(self.sendbuf_flush_ms)
    }

    pub fn sendbuf_idle(&self) -> Duration {
        Duration::from_secs(self.sendbuf_idle_secs)
    }

    pub fn sendbuf_max_age(&self) -> Duration {
        Duration::from_secs(self.sendbuf_max_age_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
