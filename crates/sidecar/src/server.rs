// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sidecar server: Unix-socket accept loop, per-client frame dispatch,
//! child supervision, graceful shutdown.
//!
//! The process is designed to outlive the Tower server that spawned it.
//! Losing every client is not a shutdown condition; only SIGTERM (or the
//! operator) ends a sidecar.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::announce;
use crate::config::Config;
use crate::frame::{read_frame, write_frame, ClientType, Frame, SpawnSpec};
use crate::hub::{ClientHandle, Hub, HubMsg, CLIENT_QUEUE_FRAMES};
use crate::pty::{ExitStatus, PtyChild};

/// Synthetic exit code reported when a SPAWN request fails to exec.
const SPAWN_FAILURE_CODE: i32 = 127;

/// Shared child identity visible to client tasks.
struct ChildState {
    pid: AtomicU32,
    alive: AtomicBool,
    cols: AtomicU16,
    rows: AtomicU16,
    start_time: String,
}

/// Channels a client task needs to act on inbound frames.
struct Dispatch {
    hub_tx: mpsc::Sender<HubMsg>,
    input_tx: mpsc::Sender<Bytes>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    spawn_tx: mpsc::Sender<SpawnSpec>,
    child: Arc<ChildState>,
}

/// Run the sidecar to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    announce::install_sigpipe_ignore();

    let listener = bind_socket(&config)?;
    let identity = announce::own_identity();
    announce::emit(&identity)?;
    info!(socket = %config.socket.display(), pid = identity.pid, "sidecar listening");

    let shutdown = CancellationToken::new();

    let (hub_tx, hub_rx) = mpsc::channel(256);
    tokio::spawn(Hub::new(config.replay_lines).run(hub_rx, shutdown.clone()));

    let child = Arc::new(ChildState {
        pid: AtomicU32::new(0),
        alive: AtomicBool::new(false),
        cols: AtomicU16::new(config.cols),
        rows: AtomicU16::new(config.rows),
        start_time: identity.start_time.clone(),
    });

    let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
    let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);
    // Capacity 1: at most one pending replacement child.
    let (spawn_tx, spawn_rx) = mpsc::channel::<SpawnSpec>(1);

    let supervisor = tokio::spawn(supervise(
        config.spawn_spec(),
        Arc::clone(&child),
        hub_tx.clone(),
        input_rx,
        resize_rx,
        spawn_rx,
        shutdown.clone(),
        config.grace(),
    ));

    spawn_signal_handler(shutdown.clone());

    let dispatch = Arc::new(Dispatch {
        hub_tx: hub_tx.clone(),
        input_tx,
        resize_tx,
        spawn_tx,
        child: Arc::clone(&child),
    });

    let mut next_client_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _)) => {
                        next_client_id += 1;
                        spawn_client(next_client_id, stream, Arc::clone(&dispatch), shutdown.clone());
                    }
                    Err(e) => debug!("accept error: {e}"),
                }
            }
        }
    }

    // Graceful path only: an abrupt exit leaves the socket file for the
    // Tower-side stale sweep.
    let _ = supervisor.await;
    let _ = std::fs::remove_file(&config.socket);
    info!("sidecar stopped");
    Ok(())
}

fn bind_socket(config: &Config) -> anyhow::Result<UnixListener> {
    if let Some(dir) = config.socket.parent() {
        std::fs::create_dir_all(dir).context("create socket directory")?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .context("restrict socket directory")?;
    }
    // A leftover file here is ours from a previous life of this path.
    let _ = std::fs::remove_file(&config.socket);
    let listener = UnixListener::bind(&config.socket).context("bind unix socket")?;
    std::fs::set_permissions(&config.socket, std::fs::Permissions::from_mode(0o600))
        .context("restrict socket file")?;
    Ok(listener)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}

/// Child lifecycle: spawn, bridge I/O, report exit, await SPAWN, repeat.
///
/// The sidecar never respawns autonomously; a replacement child only
/// arrives as an explicit SPAWN frame from the tower client.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    initial: SpawnSpec,
    state: Arc<ChildState>,
    hub_tx: mpsc::Sender<HubMsg>,
    mut input_rx: mpsc::Receiver<Bytes>,
    mut resize_rx: mpsc::Receiver<(u16, u16)>,
    mut spawn_rx: mpsc::Receiver<SpawnSpec>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    // Output forwarding survives across respawns.
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(256);
    {
        let hub_tx = hub_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                if hub_tx.send(HubMsg::Output(chunk)).await.is_err() {
                    break;
                }
            }
        });
    }

    let mut spec = initial;
    loop {
        let cols = state.cols.load(Ordering::Relaxed);
        let rows = state.rows.load(Ordering::Relaxed);

        let mut child = match PtyChild::spawn(&spec, cols, rows) {
            Ok(child) => child,
            Err(e) => {
                warn!("child spawn failed: {e:#}");
                state.alive.store(false, Ordering::Release);
                let _ = hub_tx
                    .send(HubMsg::ChildExit(ExitStatus {
                        code: Some(SPAWN_FAILURE_CODE),
                        signal: None,
                    }))
                    .await;
                match next_spawn(&mut spawn_rx, &shutdown).await {
                    Some(next) => {
                        spec = next;
                        continue;
                    }
                    None => return,
                }
            }
        };

        state.pid.store(child.child_pid(), Ordering::Release);
        state.alive.store(true, Ordering::Release);
        let _ = hub_tx.send(HubMsg::ChildSpawned).await;
        info!(pid = child.child_pid(), cmd = %spec.cmd, "child started");

        let outcome = tokio::select! {
            result = child.run(out_tx.clone(), &mut input_rx, &mut resize_rx) => Some(result),
            _ = shutdown.cancelled() => None,
        };

        state.alive.store(false, Ordering::Release);

        match outcome {
            Some(result) => {
                let status = match result {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("pty bridge error: {e:#}");
                        ExitStatus { code: Some(1), signal: None }
                    }
                };
                info!(code = ?status.code, signal = ?status.signal, "child exited");
                let _ = hub_tx.send(HubMsg::ChildExit(status)).await;

                match next_spawn(&mut spawn_rx, &shutdown).await {
                    Some(next) => spec = next,
                    None => return,
                }
            }
            None => {
                // Shutdown: SIGTERM, bounded grace, then SIGKILL.
                let pid = Pid::from_raw(child.child_pid() as i32);
                let _ = kill(pid, Signal::SIGTERM);
                reap_with_grace(pid, grace).await;
                return;
            }
        }
    }
}

/// Wait for a SPAWN request or shutdown. `None` means stop supervising.
async fn next_spawn(
    spawn_rx: &mut mpsc::Receiver<SpawnSpec>,
    shutdown: &CancellationToken,
) -> Option<SpawnSpec> {
    tokio::select! {
        spec = spawn_rx.recv() => spec,
        _ = shutdown.cancelled() => None,
    }
}

/// Poll for the child's exit up to `grace`, then SIGKILL.
async fn reap_with_grace(pid: Pid, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if tokio::time::Instant::now() >= deadline {
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = tokio::task::spawn_blocking(move || waitpid(pid, None)).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            _ => return,
        }
    }
}

fn spawn_client(
    id: u64,
    stream: UnixStream,
    dispatch: Arc<Dispatch>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(CLIENT_QUEUE_FRAMES);
    let cancel = shutdown.child_token();

    tokio::spawn(client_writer(write_half, out_rx, cancel.clone()));
    tokio::spawn(client_reader(id, read_half, out_tx, cancel, dispatch));
}

/// Per-client inbound loop. Before HELLO only HELLO is honoured; every
/// other frame is silently dropped. SIGNAL and SPAWN are honoured only from
/// the tower role.
async fn client_reader(
    id: u64,
    mut reader: OwnedReadHalf,
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    dispatch: Arc<Dispatch>,
) {
    let mut role: Option<ClientType> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(id, "dropping client on protocol error: {e}");
                break;
            }
        };

        match (role, frame) {
            (None, Frame::Hello { version: _, client_type }) => {
                let welcome = Frame::Welcome {
                    pid: dispatch.child.pid.load(Ordering::Acquire),
                    cols: dispatch.child.cols.load(Ordering::Relaxed),
                    rows: dispatch.child.rows.load(Ordering::Relaxed),
                    start_time: dispatch.child.start_time.clone(),
                };
                if out_tx.send(welcome).await.is_err() {
                    break;
                }
                let handle = ClientHandle {
                    role: client_type,
                    tx: out_tx.clone(),
                    cancel: cancel.clone(),
                };
                if dispatch.hub_tx.send(HubMsg::Register { id, handle }).await.is_err() {
                    break;
                }
                role = Some(client_type);
                debug!(id, %client_type, "client handshake complete");
            }
            // Pre-handshake: everything except HELLO is dropped.
            (None, _) => {}
            (Some(_), Frame::Data(bytes)) => {
                if dispatch.input_tx.send(bytes).await.is_err() {
                    break;
                }
            }
            (Some(_), Frame::Resize { cols, rows }) => {
                dispatch.child.cols.store(cols, Ordering::Relaxed);
                dispatch.child.rows.store(rows, Ordering::Relaxed);
                let _ = dispatch.resize_tx.try_send((cols, rows));
            }
            (Some(ClientType::Tower), Frame::Signal(name)) => {
                let pid = dispatch.child.pid.load(Ordering::Acquire);
                if pid != 0 && dispatch.child.alive.load(Ordering::Acquire) {
                    let _ = kill(Pid::from_raw(pid as i32), name.to_signal());
                }
            }
            (Some(ClientType::Tower), Frame::Spawn(spec)) => {
                // Ignored while the current child is still running.
                if !dispatch.child.alive.load(Ordering::Acquire) {
                    let _ = dispatch.spawn_tx.try_send(spec);
                }
            }
            (Some(_), Frame::Ping) => {
                if out_tx.send(Frame::Pong).await.is_err() {
                    break;
                }
            }
            // Signal/spawn from terminal clients, stray server-direction
            // frames, repeated HELLO, unknown tags: all ignored.
            (Some(_), _) => {}
        }
    }

    if role.is_some() {
        let _ = dispatch.hub_tx.send(HubMsg::Deregister { id }).await;
    }
    cancel.cancel();
}

async fn client_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = writer.shutdown().await;
}
