// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typing-aware send buffer.
//!
//! External collaborators (the protocol orchestrator, mostly) push messages
//! into sessions. Writing them straight into the PTY would interleave with
//! a user's half-typed input, so non-interrupt messages wait until the
//! session has been idle for a threshold — or until the oldest message is
//! old enough that holding it longer would be worse.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;

/// The answer to an enqueue: `deferred` is true iff the message was queued
/// rather than delivered immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    pub deferred: bool,
}

struct Queued {
    payload: Bytes,
    enqueued_at: tokio::time::Instant,
}

pub struct SendBuffer {
    queues: Mutex<HashMap<String, VecDeque<Queued>>>,
    idle_threshold: Duration,
    max_age: Duration,
    flush_interval: Duration,
}

impl SendBuffer {
    pub fn new(idle_threshold: Duration, max_age: Duration, flush_interval: Duration) -> Self {
        Self { queues: Mutex::new(HashMap::new()), idle_threshold, max_age, flush_interval }
    }

    /// Push a message toward a session.
    ///
    /// Interrupt messages are written immediately. Others deliver now only
    /// if the user is already idle and nothing is queued ahead; otherwise
    /// they join the per-session FIFO for the flusher.
    pub async fn enqueue(
        &self,
        session: Option<&Arc<Session>>,
        session_id: &str,
        payload: Bytes,
        interrupt: bool,
    ) -> EnqueueOutcome {
        let Some(session) = session else {
            debug!(session = session_id, "enqueue for unknown session rejected");
            return EnqueueOutcome { accepted: false, deferred: false };
        };
        if session.exit_info().is_some() {
            debug!(session = session_id, "enqueue for dead session rejected");
            return EnqueueOutcome { accepted: false, deferred: false };
        }

        let deliver_now = interrupt
            || (session.idle_for() >= self.idle_threshold && !self.has_queued(session_id));

        if deliver_now {
            let accepted = session.write(payload, false).await.is_ok();
            return EnqueueOutcome { accepted, deferred: false };
        }

        let mut queues = self.queues.lock();
        queues
            .entry(session_id.to_owned())
            .or_default()
            .push_back(Queued { payload, enqueued_at: tokio::time::Instant::now() });
        EnqueueOutcome { accepted: true, deferred: true }
    }

    fn has_queued(&self, session_id: &str) -> bool {
        self.queues.lock().get(session_id).map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub fn queued_len(&self, session_id: &str) -> usize {
        self.queues.lock().get(session_id).map(|q| q.len()).unwrap_or(0)
    }

    /// One flusher pass: deliver every queue whose session is idle long
    /// enough, or whose oldest message has aged out. Queues for dead or
    /// vanished sessions are discarded with a warning.
    pub async fn flush_once<F>(&self, lookup: F)
    where
        F: Fn(&str) -> Option<Arc<Session>>,
    {
        let due = self.collect_due(&lookup, false);
        self.deliver(due, &lookup).await;
    }

    /// Best-effort delivery of everything still queued (Tower shutdown).
    pub async fn force_flush<F>(&self, lookup: F)
    where
        F: Fn(&str) -> Option<Arc<Session>>,
    {
        let due = self.collect_due(&lookup, true);
        self.deliver(due, &lookup).await;
    }

    fn collect_due<F>(&self, lookup: &F, force: bool) -> Vec<(String, Vec<Bytes>)>
    where
        F: Fn(&str) -> Option<Arc<Session>>,
    {
        let mut due = Vec::new();
        let mut queues = self.queues.lock();
        queues.retain(|session_id, queue| {
            let session = match lookup(session_id) {
                Some(session) => session,
                None => {
                    warn!(session = %session_id, dropped = queue.len(), "discarding send buffer for vanished session");
                    return false;
                }
            };
            if session.exit_info().is_some() {
                warn!(session = %session_id, dropped = queue.len(), "discarding send buffer for dead session");
                return false;
            }

            let idle = session.idle_for() >= self.idle_threshold;
            let aged = queue
                .front()
                .map(|m| m.enqueued_at.elapsed() >= self.max_age)
                .unwrap_or(false);

            if force || idle || aged {
                due.push((
                    session_id.clone(),
                    queue.drain(..).map(|m| m.payload).collect(),
                ));
                false
            } else {
                true
            }
        });
        due
    }

    async fn deliver<F>(&self, due: Vec<(String, Vec<Bytes>)>, lookup: &F)
    where
        F: Fn(&str) -> Option<Arc<Session>>,
    {
        for (session_id, payloads) in due {
            let Some(session) = lookup(&session_id) else { continue };
            for payload in payloads {
                if let Err(e) = session.write(payload, false).await {
                    warn!(session = %session_id, "send buffer delivery failed: {e:#}");
                    break;
                }
            }
        }
    }

    /// Periodic flusher task.
    pub async fn run_flusher<F>(self: Arc<Self>, lookup: F, shutdown: CancellationToken)
    where
        F: Fn(&str) -> Option<Arc<Session>> + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_once(&lookup).await,
                _ = shutdown.cancelled() => {
                    // Shutdown force-flush so nothing is silently lost.
                    self.force_flush(&lookup).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "sendbuf_tests.rs"]
mod tests;
