// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY ownership: forkpty spawn, non-blocking master I/O, resize, reap.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;

use crate::frame::SpawnSpec;

/// Terminal dimensions before any client RESIZE.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Signal name for the wire (`"SIGTERM"` style), if the child was
    /// killed by a signal.
    pub fn signal_name(&self) -> Option<String> {
        let raw = self.signal?;
        Signal::try_from(raw).ok().map(|s| s.as_str().to_owned())
    }
}

/// Owned master side of the PTY, registered with the tokio reactor.
#[derive(Debug)]
struct MasterFd(OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for MasterFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 }
}

/// One child process on one PTY.
pub struct PtyChild {
    master: AsyncFd<MasterFd>,
    child_pid: Pid,
    cols: Arc<AtomicU16>,
    rows: Arc<AtomicU16>,
}

impl PtyChild {
    /// Fork a child on a fresh PTY with the requested dimensions, working
    /// directory, and environment (TERM and LANG are provided when the
    /// spec does not override them).
    // forkpty can only be called through an unsafe block
    #[allow(unsafe_code)]
    pub fn spawn(spec: &SpawnSpec, cols: u16, rows: u16) -> anyhow::Result<Self> {
        if spec.cmd.is_empty() {
            bail!("spawn spec has no command");
        }

        // SAFETY: between fork and exec the child only calls set_var,
        // set_current_dir, and execvp on data built before the fork; the
        // parent side touches nothing belonging to the child.
        let result = unsafe { forkpty(&winsize(cols, rows), None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                if std::env::var_os("LANG").is_none() {
                    std::env::set_var("LANG", "C.UTF-8");
                }
                for (k, v) in &spec.env {
                    std::env::set_var(k, v);
                }
                if !spec.cwd.is_empty() {
                    std::env::set_current_dir(&spec.cwd).context("chdir failed")?;
                }

                let mut argv = Vec::with_capacity(1 + spec.args.len());
                argv.push(spec.cmd.clone());
                argv.extend(spec.args.iter().cloned());
                let c_args: Vec<CString> = argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                // The reactor needs the master in non-blocking mode before
                // registration.
                let current = fcntl(&master, FcntlArg::F_GETFL).map_err(io::Error::from)?;
                let nonblocking = OFlag::from_bits_truncate(current) | OFlag::O_NONBLOCK;
                fcntl(&master, FcntlArg::F_SETFL(nonblocking))
                    .map_err(io::Error::from)?;

                let master =
                    AsyncFd::new(MasterFd(master)).context("register master with reactor")?;
                Ok(Self {
                    master,
                    child_pid: child,
                    cols: Arc::new(AtomicU16::new(cols)),
                    rows: Arc::new(AtomicU16::new(rows)),
                })
            }
        }
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    /// Deliver a signal to the child.
    pub fn signal(&self, sig: Signal) -> anyhow::Result<()> {
        kill(self.child_pid, sig).context("kill failed")?;
        Ok(())
    }

    /// Apply new dimensions to the PTY; the kernel raises SIGWINCH in the
    /// child's foreground process group as a side effect.
    // the TIOCSWINSZ ioctl has no safe wrapper
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);

        let ws = winsize(cols, rows);
        // SAFETY: the fd is the master we own and ws outlives the call;
        // TIOCSWINSZ only reads the struct.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context("set PTY window size");
        }
        Ok(())
    }

    /// One readiness-gated read from the master. EAGAIN is retried inside
    /// `async_io`; everything else surfaces to the caller.
    async fn pull_output(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.master
            .async_io(Interest::READABLE, |fd| {
                nix::unistd::read(fd, buf).map_err(io::Error::from)
            })
            .await
    }

    /// Write the whole chunk to the master, resuming after short writes.
    async fn push_input(&self, data: &[u8]) -> io::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let n = self
                .master
                .async_io(Interest::WRITABLE, |fd| {
                    nix::unistd::write(fd, remaining).map_err(io::Error::from)
                })
                .await?;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Bridge PTY I/O until the child exits.
    ///
    /// The receivers are borrowed, not consumed: after an exit the caller
    /// keeps them and hands them to the replacement child spawned via the
    /// SPAWN frame.
    pub async fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: &mut mpsc::Receiver<Bytes>,
        resize_rx: &mut mpsc::Receiver<(u16, u16)>,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                result = self.pull_output(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        // EIO from the master means the slave side is gone.
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                input = input_rx.recv() => {
                    match input {
                        Some(data) => self.push_input(&data).await?,
                        None => break,
                    }
                }
                dims = resize_rx.recv() => {
                    if let Some((cols, rows)) = dims {
                        let _ = self.resize(cols, rows);
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid stalling the runtime.
        let status = tokio::task::spawn_blocking(move || reap_blocking(pid))
            .await
            .context("join wait thread")??;
        Ok(status)
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        // Last-resort cleanup. If SIGHUP cannot even be delivered the child
        // was already reaped and there is nothing to escalate to.
        if kill(self.child_pid, Signal::SIGHUP).is_ok() {
            std::thread::sleep(Duration::from_millis(80));
            let _ = kill(self.child_pid, Signal::SIGKILL);
        }
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Block until the child leaves the process table and translate the wait
/// status into our `ExitStatus`.
fn reap_blocking(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            // Already collected elsewhere (e.g. a racing Drop).
            Err(Errno::ECHILD) => return Ok(ExitStatus { code: None, signal: None }),
            Err(e) => bail!("waitpid({pid}): {e}"),
        };

        match status {
            WaitStatus::Exited(_, code) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            WaitStatus::Signaled(_, sig, _core_dumped) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            // Stop/continue and ptrace events are not exits; keep waiting.
            _ => {}
        }
    }
}
