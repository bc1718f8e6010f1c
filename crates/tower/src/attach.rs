// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `towerd attach` — interactive terminal client for a sidecar socket.
//!
//! Connects as a `terminal` role client (it cannot signal or respawn the
//! child), puts the local terminal in raw mode, and proxies I/O. Because
//! it talks to the sidecar directly, it keeps working while the Tower
//! server is down or restarting. Detach with Ctrl+] (0x1d).

use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

use bytes::Bytes;
use nix::sys::termios;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use tower_sidecar::frame::{read_frame, write_frame, ClientType, Frame, PROTOCOL_VERSION};

/// Detach key: Ctrl+] (ASCII 0x1d), same as telnet / docker attach.
const DETACH_KEY: u8 = 0x1d;

#[derive(Debug, clap::Args)]
pub struct AttachArgs {
    /// Sidecar socket path to attach to.
    #[arg(long, conflicts_with = "id")]
    pub socket: Option<PathBuf>,

    /// Session id, resolved against the socket directory.
    #[arg(long)]
    pub id: Option<String>,

    /// Socket directory (default: the per-user tower directory).
    #[arg(long, env = "TOWER_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,
}

impl AttachArgs {
    fn resolve_socket(&self) -> anyhow::Result<PathBuf> {
        if let Some(ref socket) = self.socket {
            return Ok(socket.clone());
        }
        let Some(ref id) = self.id else {
            anyhow::bail!("either --socket or --id is required");
        };
        let dir = match self.socket_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let uid = nix::unistd::Uid::current().as_raw();
                PathBuf::from(format!("/tmp/tower-{uid}"))
            }
        };
        Ok(dir.join(format!("{id}.sock")))
    }
}

/// Stdin as a borrowed fd.
// BorrowedFd::borrow_raw has no safe equivalent for well-known fds
#[allow(unsafe_code)]
fn stdin_fd() -> BorrowedFd<'static> {
    // SAFETY: fd 0 is never closed by this program, so the 'static borrow
    // cannot dangle.
    unsafe { BorrowedFd::borrow_raw(std::io::stdin().as_raw_fd()) }
}

/// Raw-mode scope for the local terminal. The saved attributes go back in
/// place when this drops, whichever way the attach loop ends.
struct RawMode {
    saved: termios::Termios,
}

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        let saved = termios::tcgetattr(stdin_fd())?;
        let mut attrs = saved.clone();
        termios::cfmakeraw(&mut attrs);
        termios::tcsetattr(stdin_fd(), termios::SetArg::TCSANOW, &attrs)?;
        Ok(Self { saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(stdin_fd(), termios::SetArg::TCSANOW, &self.saved);
    }
}

/// Local terminal dimensions via TIOCGWINSZ, if stdin is a tty.
// ioctl requires unsafe for the libc call
#[allow(unsafe_code)]
fn local_winsize() -> Option<(u16, u16)> {
    let mut ws = nix::pty::Winsize { ws_col: 0, ws_row: 0, ws_xpixel: 0, ws_ypixel: 0 };
    // SAFETY: TIOCGWINSZ only fills the Winsize struct we pass in.
    let ret = unsafe { nix::libc::ioctl(stdin_fd().as_raw_fd(), nix::libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// Run the attach client. Returns the process exit code.
pub async fn run(args: AttachArgs) -> i32 {
    match attach(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("attach error: {e:#}");
            1
        }
    }
}

async fn attach(args: AttachArgs) -> anyhow::Result<i32> {
    let socket_path = args.resolve_socket()?;
    let mut stream = UnixStream::connect(&socket_path).await?;

    write_frame(
        &mut stream,
        &Frame::Hello { version: PROTOCOL_VERSION, client_type: ClientType::Terminal },
    )
    .await?;
    match read_frame(&mut stream).await? {
        Some(Frame::Welcome { pid, .. }) => {
            eprintln!("attached to sidecar (child pid {pid}); detach with Ctrl+]");
        }
        other => anyhow::bail!("unexpected handshake response: {other:?}"),
    }

    // Stdin bytes from a blocking thread; raw mode makes reads byte-wise.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let _raw = RawMode::enable()?;

    // Match the remote PTY to this terminal.
    if let Some((cols, rows)) = local_winsize() {
        write_frame(&mut stream, &Frame::Resize { cols, rows }).await?;
    }
    let mut winch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();

    let mut stdout = std::io::stdout();
    let (mut reader, mut writer) = stream.into_split();

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame::Replay(bytes))) | Ok(Some(Frame::Data(bytes))) => {
                        stdout.write_all(&bytes)?;
                        stdout.flush()?;
                    }
                    Ok(Some(Frame::Exit { code, signal })) => {
                        drop(_raw);
                        match signal {
                            Some(signal) => eprintln!("\r\nchild killed by {signal}"),
                            None => eprintln!("\r\nchild exited with code {}", code.unwrap_or(-1)),
                        }
                        return Ok(code.unwrap_or(0));
                    }
                    Ok(Some(Frame::Ping)) => {
                        write_frame(&mut writer, &Frame::Pong).await?;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        drop(_raw);
                        eprintln!("\r\nconnection closed by sidecar");
                        return Ok(0);
                    }
                }
            }

            input = stdin_rx.recv() => {
                let Some(bytes) = input else { break };
                if let Some(pos) = bytes.iter().position(|&b| b == DETACH_KEY) {
                    if pos > 0 {
                        write_frame(&mut writer, &Frame::Data(bytes.slice(..pos))).await?;
                    }
                    break;
                }
                write_frame(&mut writer, &Frame::Data(bytes)).await?;
            }

            _ = async {
                match winch {
                    Some(ref mut s) => { s.recv().await; }
                    None => std::future::pending().await,
                }
            } => {
                if let Some((cols, rows)) = local_winsize() {
                    write_frame(&mut writer, &Frame::Resize { cols, rows }).await?;
                }
            }
        }
    }

    drop(_raw);
    eprintln!("\r\ndetached (sidecar and child keep running)");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_flag_wins() {
        let args = AttachArgs {
            socket: Some(PathBuf::from("/tmp/x.sock")),
            id: None,
            socket_dir: None,
        };
        assert_eq!(args.resolve_socket().expect("resolve"), PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn id_resolves_against_directory() {
        let args = AttachArgs {
            socket: None,
            id: Some("abc".to_owned()),
            socket_dir: Some(PathBuf::from("/run/tower")),
        };
        assert_eq!(args.resolve_socket().expect("resolve"), PathBuf::from("/run/tower/abc.sock"));
    }

    #[test]
    fn missing_both_is_an_error() {
        let args = AttachArgs { socket: None, id: None, socket_dir: None };
        assert!(args.resolve_socket().is_err());
    }
}
