// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fakes for unit tests.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::backend::{BackendCommand, BackendEvent, SessionBackend};
use crate::roles::Role;
use crate::session::SessionMeta;
use tower_sidecar::frame::{SignalName, SpawnSpec};

/// Scripted backend: events are injected from the test; commands issued by
/// the session are captured for assertions.
pub struct FakeBackend {
    script: Option<mpsc::Receiver<BackendEvent>>,
    command_sink: mpsc::Sender<BackendCommand>,
    preserve: bool,
}

pub struct FakeHandles {
    pub inject: mpsc::Sender<BackendEvent>,
    pub commands: mpsc::Receiver<BackendCommand>,
}

pub fn fake_backend(preserve: bool) -> (FakeBackend, FakeHandles) {
    let (inject, script) = mpsc::channel(1024);
    let (command_sink, commands) = mpsc::channel(1024);
    (
        FakeBackend { script: Some(script), command_sink, preserve },
        FakeHandles { inject, commands },
    )
}

impl SessionBackend for FakeBackend {
    fn run(
        &mut self,
        events: mpsc::Sender<BackendEvent>,
        mut commands: mpsc::Receiver<BackendCommand>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let script = self.script.take();
        let sink = self.command_sink.clone();
        Box::pin(async move {
            let mut script = match script {
                Some(script) => script,
                None => return Ok(()),
            };
            loop {
                tokio::select! {
                    event = script.recv() => match event {
                        Some(event) => {
                            if events.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    },
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => {
                            if sink.send(cmd).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    },
                }
            }
        })
    }

    fn preserve_on_shutdown(&self) -> bool {
        self.preserve
    }

    fn supports_spawn(&self) -> bool {
        self.preserve
    }

    fn allows_signal(&self, name: SignalName) -> bool {
        self.preserve || name == SignalName::Interrupt
    }

    fn kind(&self) -> &'static str {
        if self.preserve {
            "sidecar"
        } else {
            "pty"
        }
    }
}

pub fn meta(id: &str) -> SessionMeta {
    SessionMeta {
        id: id.to_owned(),
        workspace_key: "ws".to_owned(),
        role: Role::Shell,
        supervised: false,
        persistent: true,
        created_at: 0,
        spec: SpawnSpec {
            cmd: "/bin/sh".to_owned(),
            args: vec![],
            cwd: String::new(),
            env: Default::default(),
        },
    }
}
