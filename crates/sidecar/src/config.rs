// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use crate::frame::SpawnSpec;
use crate::pty::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::replay::REPLAY_MAX_LINES;

/// PTY-owning sidecar serving a framed Unix socket.
#[derive(Debug, Parser)]
#[command(name = "tower-sidecar", version, about)]
pub struct Config {
    /// Unix socket path to listen on.
    #[arg(long, env = "TOWER_SIDECAR_SOCKET")]
    pub socket: PathBuf,

    /// Initial terminal columns.
    #[arg(long, env = "TOWER_SIDECAR_COLS", default_value_t = DEFAULT_COLS)]
    pub cols: u16,

    /// Initial terminal rows.
    #[arg(long, env = "TOWER_SIDECAR_ROWS", default_value_t = DEFAULT_ROWS)]
    pub rows: u16,

    /// Working directory for the child process.
    #[arg(long, env = "TOWER_SIDECAR_CWD")]
    pub cwd: Option<String>,

    /// Extra environment for the child (KEY=VALUE, repeatable).
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL on shutdown.
    #[arg(long, env = "TOWER_SIDECAR_GRACE", default_value = "5")]
    pub grace_secs: u64,

    /// Replay buffer bound in lines.
    #[arg(long, env = "TOWER_SIDECAR_REPLAY_LINES", default_value_t = REPLAY_MAX_LINES)]
    pub replay_lines: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TOWER_SIDECAR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (json or text).
    #[arg(long, env = "TOWER_SIDECAR_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Command to run (after --).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command.is_empty() {
            anyhow::bail!("a command must be specified");
        }
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("cols and rows must be non-zero");
        }
        for entry in &self.env {
            if !entry.contains('=') {
                anyhow::bail!("invalid --env entry (expected KEY=VALUE): {entry}");
            }
        }
        Ok(())
    }

    /// Initial spawn parameters from the CLI.
    pub fn spawn_spec(&self) -> SpawnSpec {
        let env: HashMap<String, String> = self
            .env
            .iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        SpawnSpec {
            cmd: self.command[0].clone(),
            args: self.command[1..].to_vec(),
            cwd: self.cwd.clone().unwrap_or_default(),
            env,
        }
    }

    pub fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(args)
    }

    #[test]
    fn defaults() {
        let c = parse(&["tower-sidecar", "--socket", "/tmp/t/s.sock", "--", "/bin/sh"]);
        assert_eq!(c.cols, 80);
        assert_eq!(c.rows, 24);
        assert_eq!(c.grace_secs, 5);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_command_is_rejected() {
        let c = parse(&["tower-sidecar", "--socket", "/tmp/t/s.sock"]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_env_entry_is_rejected() {
        let c = parse(&[
            "tower-sidecar",
            "--socket",
            "/tmp/t/s.sock",
            "--env",
            "NOEQUALS",
            "--",
            "/bin/sh",
        ]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn spawn_spec_carries_cwd_and_env() {
        let c = parse(&[
            "tower-sidecar",
            "--socket",
            "/tmp/t/s.sock",
            "--cwd",
            "/srv",
            "--env",
            "A=1",
            "--env",
            "B=two",
            "--",
            "/bin/sh",
            "-c",
            "true",
        ]);
        let spec = c.spawn_spec();
        assert_eq!(spec.cmd, "/bin/sh");
        assert_eq!(spec.args, vec!["-c", "true"]);
        assert_eq!(spec.cwd, "/srv");
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(spec.env.get("B").map(String::as_str), Some("two"));
    }
}
