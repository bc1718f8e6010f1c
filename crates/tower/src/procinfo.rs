// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process identity checks for pid-reuse defence.
//!
//! A descriptor records `(sidecar_pid, sidecar_start_time)` at spawn. A pid
//! alone is worthless across a Tower restart — the OS may have recycled it —
//! so every reconnect first confirms the kernel still reports the recorded
//! start time for that pid.

use sysinfo::System;

/// Kernel-reported start time (seconds since epoch) for a pid, if the
/// process exists.
pub fn start_time(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let spid = sysinfo::Pid::from_u32(pid);
    if !system.refresh_process(spid) {
        return None;
    }
    system.process(spid).map(|p| p.start_time())
}

/// Whether a process with this pid currently exists.
pub fn alive(pid: u32) -> bool {
    start_time(pid).is_some()
}

/// True iff `pid` exists *and* its start time matches the recorded one.
/// A recycled pid fails this check because start times differ.
pub fn identity_matches(pid: u32, recorded_start_time: &str) -> bool {
    if recorded_start_time.is_empty() {
        return false;
    }
    match start_time(pid) {
        Some(actual) => actual.to_string() == recorded_start_time,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let pid = std::process::id();
        assert!(alive(pid));
    }

    #[test]
    fn own_identity_matches_recorded_start_time() {
        let pid = std::process::id();
        let recorded = start_time(pid).map(|t| t.to_string()).unwrap_or_default();
        assert!(identity_matches(pid, &recorded));
    }

    #[test]
    fn wrong_start_time_fails() {
        let pid = std::process::id();
        assert!(!identity_matches(pid, "1"));
    }

    #[test]
    fn empty_recorded_time_fails() {
        assert!(!identity_matches(std::process::id(), ""));
    }

    #[test]
    fn dead_pid_fails() {
        assert!(!identity_matches(u32::MAX - 1, "12345"));
    }
}
