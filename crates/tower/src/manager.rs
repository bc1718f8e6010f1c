// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SessionManager: owns every session lifecycle.
//!
//! The in-memory table here is the runtime source of truth; the SQLite
//! registry is restart-survival metadata only. All registry mutations go
//! through this type.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tower_sidecar::frame::SpawnSpec;

use crate::backend::pty::DirectPty;
use crate::backend::sidecar::SidecarBackend;
use crate::config::Config;
use crate::error::{err, ErrorKind};
use crate::procinfo;
use crate::registry::{Registry, SessionRecord};
use crate::roles::Role;
use crate::session::{Session, SessionEvent, SessionMeta};
use crate::spawn::spawn_sidecar;
use crate::supervise::RestartState;
use crate::termlog::TermLog;

/// Parameters for `create_session`.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub workspace_key: String,
    pub role: Role,
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// None = the role's default policy.
    pub supervised: Option<bool>,
}

/// Why a session is being taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillPurpose {
    /// User kill: terminate the child and the sidecar, forget the row.
    Permanent,
    /// Tower shutdown around a surviving sidecar: drop the tower-role
    /// connection only.
    TransientDetach,
}

pub struct SessionManager {
    config: Arc<Config>,
    registry: Registry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    /// Blocks every opportunistic code path that could materialise
    /// sessions while the startup reconciliation pass runs.
    reconciling: AtomicBool,
    restarts: Mutex<HashMap<String, RestartState>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        registry: Registry,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            reconciling: AtomicBool::new(true),
            restarts: Mutex::new(HashMap::new()),
            shutdown,
        });
        (manager, events_rx)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Acquire)
    }

    pub fn set_reconciling(&self, on: bool) {
        self.reconciling.store(on, Ordering::Release);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.meta.created_at.cmp(&b.meta.created_at));
        sessions
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.meta.id.clone(), session);
    }

    fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.restarts.lock().remove(session_id);
        self.sessions.write().remove(session_id)
    }

    pub(crate) fn termlog_for(&self, session_id: &str) -> Option<TermLog> {
        self.config.session_log_dir.as_ref().map(|dir| {
            TermLog::new(dir.join(format!("{session_id}.log")), self.config.session_log_cap)
        })
    }

    /// Create a new session: spawn a sidecar, handshake, persist the
    /// descriptor, materialise the session. Falls back to a direct PTY when
    /// the role permits degraded mode.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> anyhow::Result<Arc<Session>> {
        if self.shutdown.is_cancelled() {
            return err(ErrorKind::Shutdown, "tower is shutting down");
        }
        if request.cmd.is_empty() {
            return err(ErrorKind::ConfigInvalid, "cmd must not be empty");
        }
        if request.cols == 0 || request.rows == 0 {
            return err(ErrorKind::ConfigInvalid, "cols and rows must be non-zero");
        }

        let supervised = request.supervised.unwrap_or(request.role.default_supervised());
        let session_id = uuid::Uuid::new_v4().to_string();
        let spec = SpawnSpec {
            cmd: request.cmd.clone(),
            args: request.args.clone(),
            cwd: request.cwd.clone(),
            env: request.env.clone(),
        };

        match self.try_sidecar_session(&session_id, &request, &spec, supervised).await {
            Ok(session) => Ok(session),
            Err(sidecar_error) => {
                if !request.role.allows_degraded() {
                    return Err(sidecar_error);
                }
                warn!(
                    session = %session_id,
                    "sidecar unavailable, degrading to direct pty: {sidecar_error:#}"
                );
                self.create_direct_session(&session_id, &request, &spec, supervised).await
            }
        }
    }

    async fn try_sidecar_session(
        &self,
        session_id: &str,
        request: &CreateSessionRequest,
        spec: &SpawnSpec,
        supervised: bool,
    ) -> anyhow::Result<Arc<Session>> {
        let launch =
            spawn_sidecar(&self.config, session_id, spec, request.cols, request.rows).await?;

        let (backend, _welcome) = match SidecarBackend::connect(
            &launch.socket_path,
            self.config.connect_timeout(),
            self.config.kill_grace(),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                // The sidecar came up but never spoke our protocol; do not
                // leave it running.
                let _ = kill(Pid::from_raw(launch.pid as i32), Signal::SIGTERM);
                let _ = std::fs::remove_file(&launch.socket_path);
                return Err(e);
            }
        };

        let record = SessionRecord {
            session_id: session_id.to_owned(),
            workspace_key: request.workspace_key.clone(),
            role: request.role.as_str().to_owned(),
            socket_path: launch.socket_path.to_string_lossy().into_owned(),
            sidecar_pid: launch.pid as i64,
            sidecar_start_time: launch.start_time.clone(),
            cmd: spec.cmd.clone(),
            args: serde_json::to_string(&spec.args)?,
            cwd: spec.cwd.clone(),
            env: serde_json::to_string(&spec.env)?,
            cols: request.cols as i64,
            rows: request.rows as i64,
            created_at: epoch_secs(),
            supervised,
            persistent: true,
        };
        if let Err(e) = self.registry.insert(&record).await {
            let _ = kill(Pid::from_raw(launch.pid as i32), Signal::SIGTERM);
            let _ = std::fs::remove_file(&launch.socket_path);
            return Err(e);
        }

        let meta = SessionMeta {
            id: session_id.to_owned(),
            workspace_key: request.workspace_key.clone(),
            role: request.role,
            supervised,
            persistent: true,
            created_at: record.created_at,
            spec: spec.clone(),
        };
        let session = Session::spawn(
            meta,
            backend,
            request.cols,
            request.rows,
            self.config.ring_lines,
            self.termlog_for(session_id),
            self.events_tx.clone(),
        );
        self.insert(Arc::clone(&session));
        info!(session = %session_id, role = %request.role, "sidecar session created");
        Ok(session)
    }

    async fn create_direct_session(
        &self,
        session_id: &str,
        request: &CreateSessionRequest,
        spec: &SpawnSpec,
        supervised: bool,
    ) -> anyhow::Result<Arc<Session>> {
        let backend = DirectPty::spawn(spec, request.cols, request.rows, self.config.kill_grace())?;

        let record = SessionRecord {
            session_id: session_id.to_owned(),
            workspace_key: request.workspace_key.clone(),
            role: request.role.as_str().to_owned(),
            socket_path: String::new(),
            sidecar_pid: 0,
            sidecar_start_time: String::new(),
            cmd: spec.cmd.clone(),
            args: serde_json::to_string(&spec.args)?,
            cwd: spec.cwd.clone(),
            env: serde_json::to_string(&spec.env)?,
            cols: request.cols as i64,
            rows: request.rows as i64,
            created_at: epoch_secs(),
            supervised,
            persistent: false,
        };
        self.registry.insert(&record).await?;

        let meta = SessionMeta {
            id: session_id.to_owned(),
            workspace_key: request.workspace_key.clone(),
            role: request.role,
            supervised,
            persistent: false,
            created_at: record.created_at,
            spec: spec.clone(),
        };
        let session = Session::spawn(
            meta,
            backend,
            request.cols,
            request.rows,
            self.config.ring_lines,
            self.termlog_for(session_id),
            self.events_tx.clone(),
        );
        self.insert(Arc::clone(&session));
        info!(session = %session_id, role = %request.role, "direct-pty session created (degraded)");
        Ok(session)
    }

    /// Take a session down.
    pub async fn kill_session(&self, session_id: &str, purpose: KillPurpose) -> anyhow::Result<()> {
        match purpose {
            KillPurpose::Permanent => {
                let session = self
                    .remove(session_id)
                    .ok_or_else(|| {
                        crate::error::TowerError::new(
                            ErrorKind::NotFound,
                            format!("no session {session_id}"),
                        )
                    })?;

                let _ = session.shutdown_backend(true).await;

                if let Ok(Some(record)) = self.registry.get(session_id).await {
                    self.stop_sidecar_process(&record);
                }
                self.registry.delete(session_id).await?;
                session.close();
                info!(session = %session_id, "session killed");
                Ok(())
            }
            KillPurpose::TransientDetach => {
                let Some(session) = self.get(session_id) else {
                    return err(ErrorKind::NotFound, format!("no session {session_id}"));
                };
                session.shutdown_backend(false).await
            }
        }
    }

    /// SIGTERM the sidecar process (identity-checked) and unlink its
    /// socket, best-effort.
    fn stop_sidecar_process(&self, record: &SessionRecord) {
        if !record.is_sidecar_backed() {
            return;
        }
        let pid = record.sidecar_pid as u32;
        if procinfo::identity_matches(pid, &record.sidecar_start_time) {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        let _ = std::fs::remove_file(&record.socket_path);
        let log_path = Path::new(&record.socket_path).with_extension("log");
        let _ = std::fs::remove_file(log_path);
    }

    /// Session event loop: supervised restarts, unsupervised cleanup,
    /// immediate reconnect after a backend disconnect.
    pub async fn run_events(self: Arc<Self>, mut events_rx: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = self.shutdown.cancelled() => return,
            };

            match event {
                SessionEvent::Exited { session_id, exit } => {
                    handle_exit(&self, &session_id, exit).await;
                }
                SessionEvent::Disconnected { session_id } => {
                    self.handle_disconnect(&session_id).await;
                }
            }
        }
    }

    /// Immediate reconnect after a lost sidecar connection. Distinct from
    /// the startup reconciliation sweep: this touches one session and runs
    /// while Tower is live.
    async fn handle_disconnect(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else { return };

        let record = match self.registry.get(session_id).await {
            Ok(Some(record)) if record.is_sidecar_backed() => record,
            _ => {
                warn!(session = %session_id, "disconnected session has no sidecar descriptor");
                self.remove(session_id);
                session.close();
                return;
            }
        };

        let pid = record.sidecar_pid as u32;
        if !procinfo::identity_matches(pid, &record.sidecar_start_time) {
            warn!(session = %session_id, pid, "sidecar is gone; dropping session");
            self.remove(session_id);
            let _ = self.registry.delete(session_id).await;
            let _ = std::fs::remove_file(&record.socket_path);
            session.close();
            return;
        }

        match SidecarBackend::connect(
            Path::new(&record.socket_path),
            self.config.connect_timeout(),
            self.config.kill_grace(),
        )
        .await
        {
            Ok((backend, _welcome)) => {
                info!(session = %session_id, "reconnected to sidecar after disconnect");
                session.rebind_backend(backend);
            }
            Err(e) => {
                warn!(session = %session_id, "reconnect failed, dropping session: {e:#}");
                self.remove(session_id);
                let _ = self.registry.delete(session_id).await;
                session.close();
            }
        }
    }

    /// Unlink socket files whose owning sidecar is gone.
    ///
    /// Symlinks are never followed, read, or unlinked. Sockets referenced
    /// by a live session are skipped outright; everything else is probed
    /// with a connect, and only a refused connection is treated as stale.
    pub async fn sweep_stale_sockets(&self) {
        let dir = self.config.socket_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let referenced: HashSet<PathBuf> = match self.registry.sidecar_backed().await {
            Ok(rows) => rows
                .iter()
                .filter(|row| self.get(&row.session_id).is_some())
                .map(|row| PathBuf::from(&row.socket_path))
                .collect(),
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();

            let Ok(meta) = std::fs::symlink_metadata(&path) else { continue };
            if meta.file_type().is_symlink() {
                debug!(path = %path.display(), "refusing to touch symlink in socket dir");
                continue;
            }
            if path.extension().map(|e| e != "sock").unwrap_or(true) {
                continue;
            }
            if referenced.contains(&path) {
                continue;
            }

            match tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(&path)).await {
                Ok(Ok(_stream)) => {
                    // Something answered: a live sidecar we are not
                    // attached to. Leave it for a future reconnect.
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    info!(path = %path.display(), "unlinking stale sidecar socket");
                    let _ = std::fs::remove_file(&path);
                }
                _ => {
                    // Timeout or transient error: not enough evidence.
                }
            }
        }
    }

    /// Periodic sweep task.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick was already covered by the startup sweep.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_stale_sockets().await,
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Asymmetric graceful shutdown: sidecar-backed sessions are detached
    /// and survive; direct-PTY sessions are terminated and waited for.
    pub async fn shutdown_all(&self) {
        let sessions = self.list();
        let mut direct = Vec::new();

        for session in &sessions {
            if session.preserve_on_shutdown() {
                let _ = session.shutdown_backend(false).await;
            } else {
                let _ = session.shutdown_backend(true).await;
                direct.push(Arc::clone(session));
            }
        }

        // Give direct-PTY children the grace window to die before the
        // process exits underneath them.
        let deadline = tokio::time::Instant::now() + self.config.kill_grace() + Duration::from_secs(1);
        while tokio::time::Instant::now() < deadline {
            if direct.iter().all(|s| s.exit_info().is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!(preserved = sessions.len() - direct.len(), terminated = direct.len(), "sessions shut down");
    }
}

/// Supervised restarts, unsupervised cleanup. Free function because the
/// back-off timer needs its own owned handle on the manager.
async fn handle_exit(
    manager: &Arc<SessionManager>,
    session_id: &str,
    exit: crate::session::ExitInfo,
) {
    let Some(session) = manager.get(session_id) else { return };

    if session.meta.supervised && session.meta.persistent {
        let policy = manager.config.restart_policy();
        let decision = manager
            .restarts
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .next_restart(&policy);

        match decision {
            Some(delay) => {
                info!(
                    session = %session_id,
                    code = ?exit.code,
                    delay = ?delay,
                    "supervised child exited, scheduling restart"
                );
                let manager = Arc::clone(manager);
                let id = session_id.to_owned();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if manager.shutdown.is_cancelled() {
                        return;
                    }
                    let Some(session) = manager.get(&id) else { return };
                    let spec = session.meta.spec.clone();
                    if let Err(e) = session.spawn_child(spec).await {
                        warn!(session = %id, "supervised respawn failed: {e:#}");
                    }
                });
            }
            None => {
                error!(
                    session = %session_id,
                    "supervision exhausted after repeated child exits; marking session dead"
                );
                let _ = manager.kill_session(session_id, KillPurpose::Permanent).await;
            }
        }
    } else {
        // Terminal event for unsupervised sessions.
        debug!(session = %session_id, code = ?exit.code, "unsupervised session exited");
        let _ = manager.kill_session(session_id, KillPurpose::Permanent).await;
    }
}

pub(crate) fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
