// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Detached sidecar launching.
//!
//! The detach contract has two halves, and both matter: the sidecar gets
//! its own process group so Tower's exit cannot signal it, AND its
//! stdout/stderr go to a log file at spawn time. An inherited pipe would
//! tether the sidecar to Tower's fd table and deliver broken-pipe kills
//! when Tower exits — the classic failure this module exists to prevent.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, warn};

use tower_sidecar::announce::Announce;
use tower_sidecar::frame::SpawnSpec;

use crate::config::Config;
use crate::error::{err, ErrorKind, TowerError};

/// A successfully launched sidecar, identity confirmed via its announce
/// line.
#[derive(Debug, Clone)]
pub struct SidecarLaunch {
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub pid: u32,
    pub start_time: String,
}

/// Spawn a sidecar for `session_id` and wait for its announce line.
///
/// On timeout or a malformed line the partially spawned process is killed
/// before the error is returned.
pub async fn spawn_sidecar(
    config: &Config,
    session_id: &str,
    spec: &SpawnSpec,
    cols: u16,
    rows: u16,
) -> anyhow::Result<SidecarLaunch> {
    let socket_dir = config.socket_dir();
    std::fs::create_dir_all(&socket_dir).context("create socket directory")?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(0o700))
            .context("restrict socket directory")?;
    }

    let socket_path = socket_dir.join(format!("{session_id}.sock"));
    let log_path = socket_path.with_extension("log");

    let log = std::fs::File::create(&log_path).context("create sidecar log file")?;
    let log_err = log.try_clone().context("clone sidecar log handle")?;

    let binary = sidecar_binary(config)?;
    let mut command = Command::new(&binary);
    command
        .arg("--socket")
        .arg(&socket_path)
        .arg("--cols")
        .arg(cols.to_string())
        .arg("--rows")
        .arg(rows.to_string());
    if !spec.cwd.is_empty() {
        command.arg("--cwd").arg(&spec.cwd);
    }
    for (key, value) in &spec.env {
        command.arg("--env").arg(format!("{key}={value}"));
    }
    command.arg("--").arg(&spec.cmd).args(&spec.args);

    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        // Own process group: Tower's exit or terminal signals never reach
        // the sidecar.
        .process_group(0)
        .kill_on_drop(false);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return err(
                ErrorKind::SidecarSpawnFailed,
                format!("spawn {}: {e}", binary.display()),
            )
        }
    };

    match wait_for_announce(&log_path, config.spawn_timeout()).await {
        Ok(announce) => {
            // Reap whenever the sidecar eventually exits so it cannot
            // linger as a zombie while Tower runs.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            debug!(session = session_id, pid = announce.pid, "sidecar announced");
            Ok(SidecarLaunch {
                socket_path,
                log_path,
                pid: announce.pid,
                start_time: announce.start_time,
            })
        }
        Err(e) => {
            warn!(session = session_id, "sidecar announce failed, killing partial spawn: {e:#}");
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = std::fs::remove_file(&socket_path);
            Err(e)
        }
    }
}

/// Poll the sidecar's log file until its first line parses as an announce,
/// or the deadline passes.
pub async fn wait_for_announce(log_path: &Path, deadline: Duration) -> anyhow::Result<Announce> {
    let give_up = tokio::time::Instant::now() + deadline;

    loop {
        if let Ok(contents) = tokio::fs::read_to_string(log_path).await {
            if let Some(line) = contents.lines().next() {
                if contents.contains('\n') {
                    return serde_json::from_str::<Announce>(line).map_err(|e| {
                        TowerError::new(
                            ErrorKind::SidecarSpawnFailed,
                            format!("malformed announce line {line:?}: {e}"),
                        )
                        .into()
                    });
                }
            }
        }

        if tokio::time::Instant::now() >= give_up {
            return err(
                ErrorKind::SidecarSpawnFailed,
                format!("no announce line in {} within {deadline:?}", log_path.display()),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn sidecar_binary(config: &Config) -> anyhow::Result<PathBuf> {
    if let Some(ref path) = config.sidecar_bin {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe().context("resolve current executable")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    Ok(dir.join("tower-sidecar"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[tokio::test]
    async fn announce_line_parses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("s.log");
        tokio::fs::write(&log, "{\"pid\":1234,\"startTime\":\"1700000000\"}\nlater noise\n")
            .await
            .expect("write");

        let announce =
            wait_for_announce(&log, Duration::from_secs(1)).await.expect("announce");
        assert_eq!(announce.pid, 1234);
        assert_eq!(announce.start_time, "1700000000");
    }

    #[tokio::test]
    async fn announce_waits_for_complete_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("s.log");
        tokio::fs::write(&log, "{\"pid\":12").await.expect("write");

        let log_clone = log.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::fs::write(&log_clone, "{\"pid\":12,\"startTime\":\"9\"}\n")
                .await
                .expect("write");
        });

        let announce =
            wait_for_announce(&log, Duration::from_secs(2)).await.expect("announce");
        assert_eq!(announce.pid, 12);
        writer.await.expect("join");
    }

    #[tokio::test]
    async fn announce_timeout_is_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("never.log");

        let e = wait_for_announce(&log, Duration::from_millis(200))
            .await
            .err()
            .map(|e| kind_of(&e));
        assert_eq!(e, Some(ErrorKind::SidecarSpawnFailed));
    }

    #[tokio::test]
    async fn malformed_announce_is_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("bad.log");
        tokio::fs::write(&log, "this is not json\n").await.expect("write");

        let e = wait_for_announce(&log, Duration::from_secs(1))
            .await
            .err()
            .map(|e| kind_of(&e));
        assert_eq!(e, Some(ErrorKind::SidecarSpawnFailed));
    }
}
