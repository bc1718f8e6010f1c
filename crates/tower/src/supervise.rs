// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervised auto-restart accounting.
//!
//! The child is replaced *inside the existing sidecar* (a SPAWN frame), not
//! by spawning a new sidecar: socket path, pid/start-time identity, and any
//! attached terminal clients all survive the restart.

use std::time::Duration;

/// Knobs for the restart loop.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Give up after this many restarts within one window.
    pub max_restarts: u32,
    /// Delay before the SPAWN frame is sent.
    pub backoff: Duration,
    /// A session stable for this long gets its counter cleared.
    pub reset_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 50,
            backoff: Duration::from_secs(2),
            reset_window: Duration::from_secs(300),
        }
    }
}

/// Per-session restart bookkeeping.
#[derive(Debug, Default)]
pub struct RestartState {
    count: u32,
    last_restart: Option<tokio::time::Instant>,
}

impl RestartState {
    /// Account for one child exit. Returns the backoff to wait before
    /// respawning, or `None` when supervision is exhausted.
    pub fn next_restart(&mut self, policy: &RestartPolicy) -> Option<Duration> {
        let now = tokio::time::Instant::now();

        if let Some(last) = self.last_restart {
            if now.duration_since(last) >= policy.reset_window {
                self.count = 0;
            }
        }

        if self.count >= policy.max_restarts {
            return None;
        }

        self.count += 1;
        self.last_restart = Some(now);
        Some(policy.backoff)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
#[path = "supervise_tests.rs"]
mod tests;
