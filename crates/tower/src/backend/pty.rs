// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Direct-PTY backend: graceful-degradation fallback when a sidecar cannot
//! be spawned. The child lives inside the Tower process and therefore dies
//! with it; `preserve_on_shutdown` is false.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::debug;

use tower_sidecar::frame::{SignalName, SpawnSpec};
use tower_sidecar::pty::PtyChild;

use super::{BackendCommand, BackendEvent, SessionBackend};

pub struct DirectPty {
    child: Option<PtyChild>,
    pid: u32,
    grace: Duration,
}

impl DirectPty {
    pub fn spawn(spec: &SpawnSpec, cols: u16, rows: u16, grace: Duration) -> anyhow::Result<Self> {
        let child = PtyChild::spawn(spec, cols, rows)?;
        let pid = child.child_pid();
        Ok(Self { child: Some(child), pid, grace })
    }

    pub fn child_pid(&self) -> u32 {
        self.pid
    }
}

impl SessionBackend for DirectPty {
    fn run(
        &mut self,
        events: mpsc::Sender<BackendEvent>,
        mut commands: mpsc::Receiver<BackendCommand>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let child = self.child.take();
        let pid = Pid::from_raw(self.pid as i32);
        let grace = self.grace;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| anyhow!("pty backend already consumed"))?;

            let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(256);
            let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
            let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);

            let bridge = tokio::spawn(async move {
                let mut input_rx = input_rx;
                let mut resize_rx = resize_rx;
                child.run(out_tx, &mut input_rx, &mut resize_rx).await
            });

            let mut kill_at: Option<tokio::time::Instant> = None;
            let mut commands_open = true;

            loop {
                tokio::select! {
                    out = out_rx.recv() => {
                        match out {
                            Some(bytes) => {
                                let _ = events.send(BackendEvent::Output(bytes)).await;
                            }
                            // PTY closed: the bridge is finishing.
                            None => break,
                        }
                    }

                    cmd = commands.recv(), if commands_open => {
                        match cmd {
                            Some(BackendCommand::Write(bytes)) => {
                                let _ = input_tx.send(bytes).await;
                            }
                            Some(BackendCommand::Resize { cols, rows }) => {
                                let _ = resize_tx.try_send((cols, rows));
                            }
                            Some(BackendCommand::Signal(name)) => {
                                let _ = kill(pid, name.to_signal());
                            }
                            Some(BackendCommand::Spawn(_)) => {
                                debug!("spawn command ignored by direct-pty backend");
                            }
                            Some(BackendCommand::Shutdown { .. }) | None => {
                                // Direct-PTY sessions are never preserved:
                                // terminate, bounded grace, then kill.
                                let _ = kill(pid, Signal::SIGTERM);
                                kill_at = Some(tokio::time::Instant::now() + grace);
                                commands_open = cmd.is_some();
                            }
                        }
                    }

                    _ = async {
                        match kill_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    }, if kill_at.is_some() => {
                        let _ = kill(pid, Signal::SIGKILL);
                        kill_at = None;
                    }
                }
            }

            let status = match bridge.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    debug!("pty bridge error: {e:#}");
                    tower_sidecar::pty::ExitStatus { code: Some(1), signal: None }
                }
                Err(e) => {
                    debug!("pty bridge panicked: {e}");
                    tower_sidecar::pty::ExitStatus { code: Some(1), signal: None }
                }
            };

            let _ = events
                .send(BackendEvent::Exit { code: status.code, signal: status.signal_name() })
                .await;
            Ok(())
        })
    }

    fn preserve_on_shutdown(&self) -> bool {
        false
    }

    fn supports_spawn(&self) -> bool {
        false
    }

    /// Only interrupt is supported on a direct PTY; the rest of the
    /// allow-list is reserved for sidecar-backed sessions.
    fn allows_signal(&self, name: SignalName) -> bool {
        name == SignalName::Interrupt
    }

    fn kind(&self) -> &'static str {
        "pty"
    }
}
