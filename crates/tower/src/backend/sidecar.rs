// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sidecar-client backend: the Tower end of a sidecar's Unix socket.
//!
//! Connects with `HELLO{tower}` (displacing any previous tower client),
//! surfaces REPLAY/DATA/EXIT as backend events, and forwards session
//! commands as frames. A lost connection ends the backend with a
//! `Disconnected` event; the immediate-reconnect decision belongs to the
//! SessionManager, which re-checks the sidecar's identity first. The
//! backend never reconnects on its own — a displaced tower client that
//! dialled back in would just displace its successor.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use tower_sidecar::frame::{
    read_frame, write_frame, ClientType, Frame, SignalName, PROTOCOL_VERSION,
};

use super::{BackendCommand, BackendEvent, SessionBackend};
use crate::error::{err, ErrorKind};

/// Identity and dimensions reported by the sidecar's WELCOME.
#[derive(Debug, Clone)]
pub struct WelcomeInfo {
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    pub start_time: String,
}

pub struct SidecarBackend {
    socket_path: PathBuf,
    connect_timeout: Duration,
    grace: Duration,
    conn: Option<UnixStream>,
}

impl SidecarBackend {
    /// Connect and perform the tower-role handshake up front so callers
    /// fail fast. The established stream is reused by [`run`]; the next
    /// frame on it will be the sidecar's REPLAY.
    pub async fn connect(
        socket_path: &Path,
        connect_timeout: Duration,
        grace: Duration,
    ) -> anyhow::Result<(Self, WelcomeInfo)> {
        let (stream, welcome) = handshake(socket_path, connect_timeout).await?;
        Ok((
            Self {
                socket_path: socket_path.to_owned(),
                connect_timeout,
                grace,
                conn: Some(stream),
            },
            welcome,
        ))
    }
}

async fn handshake(
    socket_path: &Path,
    deadline: Duration,
) -> anyhow::Result<(UnixStream, WelcomeInfo)> {
    let mut stream = match timeout(deadline, UnixStream::connect(socket_path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return err(
                ErrorKind::SidecarUnreachable,
                format!("connect {}: {e}", socket_path.display()),
            )
        }
        Err(_) => {
            return err(
                ErrorKind::SidecarUnreachable,
                format!("connect {}: timed out", socket_path.display()),
            )
        }
    };

    write_frame(
        &mut stream,
        &Frame::Hello { version: PROTOCOL_VERSION, client_type: ClientType::Tower },
    )
    .await?;

    match timeout(deadline, read_frame(&mut stream)).await {
        Ok(Ok(Some(Frame::Welcome { pid, cols, rows, start_time }))) => {
            Ok((stream, WelcomeInfo { pid, cols, rows, start_time }))
        }
        Ok(Ok(other)) => err(
            ErrorKind::SidecarProtocolError,
            format!("expected WELCOME, got {other:?}"),
        ),
        Ok(Err(e)) => err(ErrorKind::SidecarProtocolError, format!("handshake read: {e}")),
        Err(_) => err(ErrorKind::SidecarUnreachable, "handshake timed out"),
    }
}

impl SessionBackend for SidecarBackend {
    fn run(
        &mut self,
        events: mpsc::Sender<BackendEvent>,
        mut commands: mpsc::Receiver<BackendCommand>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let mut conn = self.conn.take();
        let socket_path = self.socket_path.clone();
        let connect_timeout = self.connect_timeout;
        let grace = self.grace;

        Box::pin(async move {
            let stream = match conn.take() {
                Some(stream) => stream,
                None => match handshake(&socket_path, connect_timeout).await {
                    Ok((stream, _welcome)) => stream,
                    Err(e) => {
                        debug!("sidecar connect failed: {e:#}");
                        let _ = events.send(BackendEvent::Disconnected).await;
                        return Ok(());
                    }
                },
            };

            let (reader, writer) = stream.into_split();
            match serve_connection(reader, writer, &events, &mut commands, grace).await {
                ConnectionEnd::Shutdown => {}
                ConnectionEnd::Lost => {
                    warn!(socket = %socket_path.display(), "sidecar connection lost");
                    let _ = events.send(BackendEvent::Disconnected).await;
                }
            }
            Ok(())
        })
    }

    fn preserve_on_shutdown(&self) -> bool {
        true
    }

    fn supports_spawn(&self) -> bool {
        true
    }

    fn allows_signal(&self, _name: SignalName) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "sidecar"
    }
}

enum ConnectionEnd {
    /// The session asked us to stop (or dropped the command channel).
    Shutdown,
    /// The socket died underneath us.
    Lost,
}

async fn serve_connection(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    events: &mpsc::Sender<BackendEvent>,
    commands: &mut mpsc::Receiver<BackendCommand>,
    grace: Duration,
) -> ConnectionEnd {
    // Set when a terminating shutdown sent SIGNAL(terminate); on expiry we
    // escalate to SIGNAL(kill) and stop.
    let mut kill_at: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame::Replay(bytes))) => {
                        let _ = events.send(BackendEvent::Replay(bytes)).await;
                    }
                    Ok(Some(Frame::Data(bytes))) => {
                        let _ = events.send(BackendEvent::Output(bytes)).await;
                    }
                    Ok(Some(Frame::Exit { code, signal })) => {
                        let _ = events.send(BackendEvent::Exit { code, signal }).await;
                        if kill_at.is_some() {
                            // Child is down; the terminating shutdown is done.
                            return ConnectionEnd::Shutdown;
                        }
                    }
                    Ok(Some(Frame::Ping)) => {
                        if write_frame(&mut writer, &Frame::Pong).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                    }
                    // WELCOME replays, PONG, and unknown tags are ignorable.
                    Ok(Some(_)) => {}
                    Ok(None) => return ConnectionEnd::Lost,
                    Err(e) => {
                        debug!("sidecar frame error: {e}");
                        return ConnectionEnd::Lost;
                    }
                }
            }

            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(BackendCommand::Write(bytes)) => Frame::Data(bytes),
                    Some(BackendCommand::Resize { cols, rows }) => Frame::Resize { cols, rows },
                    Some(BackendCommand::Signal(name)) => Frame::Signal(name),
                    Some(BackendCommand::Spawn(spec)) => Frame::Spawn(spec),
                    Some(BackendCommand::Shutdown { terminate_child: false }) | None => {
                        // Transient detach: closing the socket is the whole
                        // operation; the sidecar and child live on.
                        return ConnectionEnd::Shutdown;
                    }
                    Some(BackendCommand::Shutdown { terminate_child: true }) => {
                        kill_at = Some(tokio::time::Instant::now() + grace);
                        Frame::Signal(SignalName::Terminate)
                    }
                };
                if write_frame(&mut writer, &frame).await.is_err() {
                    return ConnectionEnd::Lost;
                }
            }

            _ = async {
                match kill_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            }, if kill_at.is_some() => {
                let _ = write_frame(&mut writer, &Frame::Signal(SignalName::Kill)).await;
                return ConnectionEnd::Shutdown;
            }
        }
    }
}
