// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup announcement: the single stdout line the spawning Tower consumes
//! from the sidecar's log file to learn its pid and start time.

use std::io::Write;

use nix::sys::signal::{SigHandler, Signal};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// The one-line JSON handshake printed to stdout at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub pid: u32,
    pub start_time: String,
}

/// Look up this process's own identity.
///
/// The start time (seconds since epoch, from the kernel's process table) is
/// what defeats pid reuse: a recycled pid will not reproduce it.
pub fn own_identity() -> Announce {
    let pid = std::process::id();
    Announce { pid, start_time: start_time_of(pid).unwrap_or(0).to_string() }
}

/// Kernel-reported start time for an arbitrary pid.
pub fn start_time_of(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let spid = sysinfo::Pid::from_u32(pid);
    if !system.refresh_process(spid) {
        return None;
    }
    system.process(spid).map(|p| p.start_time())
}

/// Print the announce line and flush so the parent's deadline read sees it.
pub fn emit(announce: &Announce) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, announce)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Ignore SIGPIPE so a write to a closed stdio stream after the parent
/// exits cannot kill the sidecar.
// signal() is an unsafe libc-level call
#[allow(unsafe_code)]
pub fn install_sigpipe_ignore() {
    // SAFETY: installing SigIgn for SIGPIPE is async-signal-safe and has no
    // handler body that could violate signal-safety rules.
    let _ = unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_identity_has_current_pid() {
        let id = own_identity();
        assert_eq!(id.pid, std::process::id());
        assert_ne!(id.start_time, "0", "own process must be visible in the process table");
    }

    #[test]
    fn announce_line_is_camel_case_json() {
        let line = serde_json::to_string(&Announce { pid: 9, start_time: "42".to_owned() })
            .expect("serialize");
        assert_eq!(line, r#"{"pid":9,"startTime":"42"}"#);
    }

    #[test]
    fn start_time_of_dead_pid_is_none() {
        // Pid close to the max is vanishingly unlikely to exist.
        assert_eq!(start_time_of(u32::MAX - 1), None);
    }
}
