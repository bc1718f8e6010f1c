// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scenario tests.
//!
//! Scenario tests run a real sidecar server in-process (its lib is the
//! same code the `tower-sidecar` binary wraps) on a tempdir socket, then
//! exercise Tower's manager against it. "Restarting Tower" is dropping one
//! manager and reconciling a fresh one against the same registry file —
//! which is exactly what a process restart amounts to, minus the exec.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use towerd::config::Config;
use towerd::manager::SessionManager;
use towerd::registry::{Registry, SessionRecord};
use towerd::session::{SessionEvent, SubscriberEvent};

pub const WAIT: Duration = Duration::from_secs(10);

/// Start an in-process sidecar server for `command` on a socket inside
/// `dir`. Returns the socket path once it is accepting.
pub async fn start_sidecar(dir: &Path, name: &str, command: &[&str]) -> PathBuf {
    let socket = dir.join(format!("{name}.sock"));
    let config = tower_sidecar::config::Config {
        socket: socket.clone(),
        cols: 80,
        rows: 24,
        cwd: None,
        env: vec![],
        grace_secs: 2,
        replay_lines: 1000,
        log_level: "warn".to_owned(),
        log_format: "text".to_owned(),
        command: command.iter().map(|s| (*s).to_owned()).collect(),
    };
    tokio::spawn(tower_sidecar::server::run(config));

    let deadline = tokio::time::Instant::now() + WAIT;
    while !socket.exists() {
        assert!(tokio::time::Instant::now() < deadline, "sidecar socket never appeared");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    socket
}

/// A Tower "process": config + registry + manager over a shared data dir.
pub struct TowerInstance {
    pub manager: Arc<SessionManager>,
    pub events_rx: Option<tokio::sync::mpsc::Receiver<SessionEvent>>,
}

/// Boot a Tower instance against an existing data/socket dir, mimicking
/// the server's startup ordering (sweep, reconcile, open APIs).
pub async fn boot_tower(data_dir: &Path, socket_dir: &Path, extra_args: &[&str]) -> TowerInstance {
    let mut args = vec![
        "towerd".to_owned(),
        "--data-dir".to_owned(),
        data_dir.to_string_lossy().into_owned(),
        "--socket-dir-override".to_owned(),
        socket_dir.to_string_lossy().into_owned(),
        "--sidecar-bin".to_owned(),
        "/nonexistent/tower-sidecar".to_owned(),
        "--connect-timeout-secs".to_owned(),
        "2".to_owned(),
        "--kill-grace-secs".to_owned(),
        "1".to_owned(),
    ];
    args.extend(extra_args.iter().map(|s| (*s).to_owned()));
    let config = Arc::new(Config::parse_from(args));

    let registry = Registry::open(&config.registry_path()).await.expect("open registry");
    let (manager, events_rx) =
        SessionManager::new(config, registry, CancellationToken::new());

    manager.sweep_stale_sockets().await;
    manager.reconcile().await;
    manager.set_reconciling(false);

    TowerInstance { manager, events_rx: Some(events_rx) }
}

/// A descriptor row pointing at an in-process sidecar with an explicit
/// recorded process identity.
pub fn sidecar_record_with_identity(
    session_id: &str,
    socket: &Path,
    cmd: &[&str],
    pid: u32,
    start_time: &str,
) -> SessionRecord {
    SessionRecord {
        session_id: session_id.to_owned(),
        workspace_key: "ws-spec".to_owned(),
        role: "shell".to_owned(),
        socket_path: socket.to_string_lossy().into_owned(),
        sidecar_pid: pid as i64,
        sidecar_start_time: start_time.to_owned(),
        cmd: cmd.first().map(|s| (*s).to_owned()).unwrap_or_default(),
        args: serde_json::to_string(&cmd.iter().skip(1).collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_owned()),
        cwd: String::new(),
        env: "{}".to_owned(),
        cols: 80,
        rows: 24,
        created_at: 0,
        supervised: false,
        persistent: true,
    }
}

/// A descriptor row whose recorded identity is this test process (the
/// in-process sidecar lives inside it, after all).
pub fn own_sidecar_record(session_id: &str, socket: &Path, cmd: &[&str]) -> SessionRecord {
    let pid = std::process::id();
    let start = towerd::procinfo::start_time(pid).map(|t| t.to_string()).unwrap_or_default();
    sidecar_record_with_identity(session_id, socket, cmd, pid, &start)
}

/// A long-lived throwaway process whose identity can stand in for a
/// sidecar when a test will SIGTERM the recorded pid (never record the
/// test process itself for those).
pub fn spawn_decoy() -> anyhow::Result<(std::process::Child, u32, String)> {
    let child = std::process::Command::new("/bin/sleep")
        .arg("600")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    let pid = child.id();
    let start = towerd::procinfo::start_time(pid).map(|t| t.to_string()).unwrap_or_default();
    Ok((child, pid, start))
}

/// Drain subscriber events until the accumulated output contains `needle`.
pub async fn read_until_contains(
    events: &mut tokio::sync::mpsc::Receiver<SubscriberEvent>,
    seed: &[u8],
    needle: &str,
) -> String {
    let mut seen = seed.to_vec();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if String::from_utf8_lossy(&seen).contains(needle) {
            return String::from_utf8_lossy(&seen).into_owned();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "never saw {needle:?} in {:?}",
            String::from_utf8_lossy(&seen)
        );
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Some(SubscriberEvent::Data(chunk))) => seen.extend_from_slice(&chunk.data),
            Ok(Some(SubscriberEvent::Exit(_))) => {}
            Ok(None) => panic!("subscriber channel closed while waiting for {needle:?}"),
            Err(_) => panic!("timed out waiting for {needle:?}"),
        }
    }
}

/// Resolve the compiled `towerd` binary, if this test run produced one.
pub fn towerd_binary() -> Option<PathBuf> {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent())?;
    let path = workspace.join("target").join("debug").join("towerd");
    path.exists().then_some(path)
}

/// Minimal HTTP/1.1 GET over TCP, returning (status line, body).
pub async fn http_get(addr: &str, path: &str) -> anyhow::Result<(String, String)> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);
    let status = response.lines().next().unwrap_or_default().to_owned();
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b.to_owned()).unwrap_or_default();
    Ok((status, body))
}
