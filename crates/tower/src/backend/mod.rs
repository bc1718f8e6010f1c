// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session backend abstraction.
//!
//! A session never branches on what is behind it: both the sidecar client
//! and the in-process PTY expose the same small capability set (write,
//! resize, signal, spawn, shutdown) over a command/event channel pair.

pub mod pty;
pub mod sidecar;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

use tower_sidecar::frame::{SignalName, SpawnSpec};

/// Events a backend emits toward its session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// One-shot history snapshot (sidecar REPLAY). Sent before any
    /// `Output` for a given connection.
    Replay(Bytes),
    Output(Bytes),
    Exit { code: Option<i32>, signal: Option<String> },
    /// The transport to the backend is gone but the child may live on
    /// (sidecar connection lost). Terminal for this backend task.
    Disconnected,
}

/// Commands a session issues toward its backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    Write(Bytes),
    Resize { cols: u16, rows: u16 },
    Signal(SignalName),
    /// Replace an exited child (supervised restart). Sidecar only.
    Spawn(SpawnSpec),
    /// End this backend. `terminate_child=false` is the transient detach
    /// used when Tower shuts down around a surviving sidecar.
    Shutdown { terminate_child: bool },
}

/// Object-safe backend trait, run once per binding.
pub trait SessionBackend: Send + 'static {
    fn run(
        &mut self,
        events: mpsc::Sender<BackendEvent>,
        commands: mpsc::Receiver<BackendCommand>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Sidecar-backed sessions survive Tower shutdown.
    fn preserve_on_shutdown(&self) -> bool;

    /// Whether SPAWN (supervised restart) is available.
    fn supports_spawn(&self) -> bool;

    /// Whether this backend honours the given signal via the signal API.
    fn allows_signal(&self, name: SignalName) -> bool;

    fn kind(&self) -> &'static str;
}

/// Conversion trait so both concrete backends and `Box<dyn SessionBackend>`
/// can be handed to the session without explicit boxing.
pub trait Boxed {
    fn boxed(self) -> Box<dyn SessionBackend>;
}

impl<T: SessionBackend> Boxed for T {
    fn boxed(self) -> Box<dyn SessionBackend> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn SessionBackend> {
    fn boxed(self) -> Box<dyn SessionBackend> {
        self
    }
}
