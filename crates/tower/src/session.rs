// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One terminal session: bounded replay ring, subscriber fan-out, typing
//! timestamp, and a swappable backend binding.
//!
//! Subscribers never share queues; a saturated subscriber is dropped from
//! this session without touching the others. The backend is bound through
//! a command channel so the manager can rebind a reconnected sidecar
//! without disturbing attached subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendCommand, BackendEvent, Boxed, SessionBackend};
use crate::error::{err, ErrorKind};
use crate::ring::{OutputChunk, OutputRing};
use crate::roles::Role;
use crate::termlog::TermLog;
use tower_sidecar::frame::{SignalName, SpawnSpec};

/// Outbound queue depth per subscriber, in events.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// How a session's child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Events delivered to one subscriber, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    Data(OutputChunk),
    Exit(ExitInfo),
}

/// Events a session reports upward to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Exited { session_id: String, exit: ExitInfo },
    Disconnected { session_id: String },
}

/// Immutable descriptor data mirrored into the runtime session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub workspace_key: String,
    pub role: Role,
    pub supervised: bool,
    pub persistent: bool,
    pub created_at: i64,
    pub spec: SpawnSpec,
}

struct SubscriberHandle {
    tx: mpsc::Sender<SubscriberEvent>,
    /// Highest seq already covered by this subscriber's replay; fan-out
    /// skips anything at or below it so replay and live never overlap.
    after_seq: u64,
}

/// Result of [`Session::attach`].
pub struct Attachment {
    pub subscriber_id: u64,
    /// Chunks to deliver before any live event.
    pub replay: Vec<OutputChunk>,
    /// Seq high-water mark the replay covers; live delivery is contiguous
    /// from here, so subscribers can count frames to track seqs.
    pub replay_seq: u64,
    pub events: mpsc::Receiver<SubscriberEvent>,
}

pub struct Session {
    pub meta: SessionMeta,
    ring: RwLock<OutputRing>,
    subscribers: Mutex<HashMap<u64, SubscriberHandle>>,
    next_subscriber: AtomicU64,
    /// Last wall-clock moment a data frame arrived from a subscriber.
    /// Control frames (resize, ping) deliberately do not touch this.
    last_input_at: Mutex<tokio::time::Instant>,
    command_tx: Mutex<mpsc::Sender<BackendCommand>>,
    events_tx: mpsc::Sender<BackendEvent>,
    exit: Mutex<Option<ExitInfo>>,
    disconnected: AtomicBool,
    closed: CancellationToken,
    cols: AtomicU16,
    rows: AtomicU16,
    /// Capabilities captured from the bound backend.
    preserve: bool,
    supports_spawn: bool,
    signal_all: bool,
    backend_kind: &'static str,
}

impl Session {
    /// Build the session, bind its backend, and start the event pump.
    pub fn spawn(
        meta: SessionMeta,
        backend: impl Boxed,
        cols: u16,
        rows: u16,
        ring_lines: usize,
        termlog: Option<TermLog>,
        manager_tx: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let backend = backend.boxed();
        let (events_tx, events_rx) = mpsc::channel(256);

        // Capture capabilities before the backend moves into its task.
        let preserve = backend.preserve_on_shutdown();
        let supports_spawn = backend.supports_spawn();
        let signal_all = backend.allows_signal(SignalName::Terminate);
        let backend_kind = backend.kind();

        let session = Arc::new(Self {
            ring: RwLock::new(OutputRing::new(ring_lines)),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            last_input_at: Mutex::new(tokio::time::Instant::now()),
            command_tx: Mutex::new(bind(backend, events_tx.clone(), &meta.id)),
            events_tx,
            exit: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            closed: CancellationToken::new(),
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            preserve,
            supports_spawn,
            signal_all,
            backend_kind,
            meta,
        });

        tokio::spawn(pump(Arc::clone(&session), events_rx, manager_tx, termlog));
        session
    }

    /// Swap in a fresh backend (sidecar reconnect). Subscribers and the
    /// ring are untouched; the old backend task ends when its command
    /// channel drops.
    pub fn rebind_backend(&self, backend: impl Boxed) {
        let tx = bind(backend.boxed(), self.events_tx.clone(), &self.meta.id);
        *self.command_tx.lock() = tx;
        self.disconnected.store(false, Ordering::Release);
    }

    /// Attach a subscriber.
    ///
    /// The returned replay chunks (the full ring, or only chunks after
    /// `resume_after`) are delivered before anything arrives on the live
    /// receiver; `replay_seq` is the high-water mark they cover. If the
    /// session already exited, the EXIT event is queued behind the replay.
    pub fn attach(&self, resume_after: Option<u64>) -> Attachment {
        let mut subscribers = self.subscribers.lock();
        let ring = self.ring.read();
        let replay = match resume_after {
            Some(seq) => ring.after(seq),
            None => ring.snapshot(),
        };
        let after_seq = ring.last_seq();
        drop(ring);

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        if let Some(exit) = self.exit.lock().clone() {
            let _ = tx.try_send(SubscriberEvent::Exit(exit));
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(id, SubscriberHandle { tx, after_seq });
        Attachment { subscriber_id: id, replay, replay_seq: after_seq, events: rx }
    }

    pub fn detach(&self, subscriber_id: u64) {
        self.subscribers.lock().remove(&subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Write bytes to the backend. `from_subscriber` marks human input and
    /// refreshes the typing timestamp; injected messages pass false.
    pub async fn write(&self, data: Bytes, from_subscriber: bool) -> anyhow::Result<()> {
        if from_subscriber {
            *self.last_input_at.lock() = tokio::time::Instant::now();
        }
        self.send_command(BackendCommand::Write(data)).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        if cols == 0 || rows == 0 {
            return err(ErrorKind::ConfigInvalid, "cols and rows must be non-zero");
        }
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        self.send_command(BackendCommand::Resize { cols, rows }).await
    }

    pub async fn signal(&self, name: SignalName) -> anyhow::Result<()> {
        if !self.signal_all && name != SignalName::Interrupt {
            return err(
                ErrorKind::ConfigInvalid,
                format!("signal {name} is not supported on a direct-pty session"),
            );
        }
        self.send_command(BackendCommand::Signal(name)).await
    }

    /// Replace the exited child (supervised restart path).
    pub async fn spawn_child(&self, spec: SpawnSpec) -> anyhow::Result<()> {
        if !self.supports_spawn {
            return err(ErrorKind::ConfigInvalid, "spawn requires a sidecar-backed session");
        }
        *self.exit.lock() = None;
        self.send_command(BackendCommand::Spawn(spec)).await
    }

    /// Ask the backend to stop. With `terminate_child=false` this only
    /// drops Tower's tower-role connection; the sidecar survives.
    pub async fn shutdown_backend(&self, terminate_child: bool) -> anyhow::Result<()> {
        self.send_command(BackendCommand::Shutdown { terminate_child }).await
    }

    async fn send_command(&self, command: BackendCommand) -> anyhow::Result<()> {
        let tx = self.command_tx.lock().clone();
        if tx.send(command).await.is_err() {
            return err(ErrorKind::ChildExited, format!("session {} backend is gone", self.meta.id));
        }
        Ok(())
    }

    /// Time since the last subscriber data frame.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_input_at.lock().elapsed()
    }

    pub fn last_seq(&self) -> u64 {
        self.ring.read().last_seq()
    }

    /// Concatenated ring contents (the `GET /terminals/{id}/output` body).
    pub fn output_snapshot(&self) -> (Vec<u8>, u64) {
        let ring = self.ring.read();
        let mut data = Vec::new();
        for chunk in ring.snapshot() {
            data.extend_from_slice(&chunk.data);
        }
        (data, ring.last_seq())
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn preserve_on_shutdown(&self) -> bool {
        self.preserve
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend_kind
    }

    /// Permanently stop the event pump and drop all subscribers.
    pub fn close(&self) {
        self.closed.cancel();
        self.subscribers.lock().clear();
    }

    fn fanout(&self, chunk: OutputChunk) {
        let mut subscribers = self.subscribers.lock();
        let mut dropped = Vec::new();
        for (id, handle) in subscribers.iter() {
            if chunk.seq <= handle.after_seq {
                continue;
            }
            if handle.tx.try_send(SubscriberEvent::Data(chunk.clone())).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            warn!(session = %self.meta.id, subscriber = id, "subscriber queue saturated, dropping");
            subscribers.remove(&id);
        }
    }

    fn fanout_exit(&self, exit: ExitInfo) {
        let mut subscribers = self.subscribers.lock();
        let mut dropped = Vec::new();
        for (id, handle) in subscribers.iter() {
            if handle.tx.try_send(SubscriberEvent::Exit(exit.clone())).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            subscribers.remove(&id);
        }
    }
}

fn bind(
    mut backend: Box<dyn SessionBackend>,
    events_tx: mpsc::Sender<BackendEvent>,
    session_id: &str,
) -> mpsc::Sender<BackendCommand> {
    let (command_tx, command_rx) = mpsc::channel(64);
    let id = session_id.to_owned();
    tokio::spawn(async move {
        if let Err(e) = backend.run(events_tx, command_rx).await {
            warn!(session = %id, "backend task failed: {e:#}");
        }
    });
    command_tx
}

/// Session event pump: backend events → ring append → fan-out → upward
/// notifications. One per session, ends when the session is closed.
async fn pump(
    session: Arc<Session>,
    mut events_rx: mpsc::Receiver<BackendEvent>,
    manager_tx: mpsc::Sender<SessionEvent>,
    mut termlog: Option<TermLog>,
) {
    loop {
        let event = tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = session.closed.cancelled() => break,
        };

        match event {
            BackendEvent::Replay(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                // Replay only seeds an empty ring: on a mid-life reconnect
                // the ring already covers this history.
                let chunk = {
                    let mut ring = session.ring.write();
                    if ring.last_seq() > 0 {
                        None
                    } else {
                        let seq = ring.push(bytes.clone());
                        Some(OutputChunk { seq, data: bytes })
                    }
                };
                if let Some(chunk) = chunk {
                    if let Some(ref mut log) = termlog {
                        log.write(&chunk.data);
                    }
                    session.fanout(chunk);
                }
            }
            BackendEvent::Output(bytes) => {
                if let Some(ref mut log) = termlog {
                    log.write(&bytes);
                }
                let chunk = {
                    let mut ring = session.ring.write();
                    let seq = ring.push(bytes.clone());
                    OutputChunk { seq, data: bytes }
                };
                session.fanout(chunk);
            }
            BackendEvent::Exit { code, signal } => {
                let exit = ExitInfo { code, signal };
                *session.exit.lock() = Some(exit.clone());
                session.fanout_exit(exit.clone());
                let _ = manager_tx
                    .send(SessionEvent::Exited { session_id: session.meta.id.clone(), exit })
                    .await;
            }
            BackendEvent::Disconnected => {
                session.disconnected.store(true, Ordering::Release);
                debug!(session = %session.meta.id, "backend disconnected");
                let _ = manager_tx
                    .send(SessionEvent::Disconnected { session_id: session.meta.id.clone() })
                    .await;
            }
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
