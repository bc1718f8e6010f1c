// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client fan-out hub.
//!
//! One task owns the replay buffer and the set of handshake-complete
//! clients. PTY output and child exits arrive as messages; broadcasts go
//! out through per-client bounded queues. A client whose queue is full is
//! disconnected on the spot so the hub never blocks on a slow reader.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{ClientType, Frame};
use crate::pty::ExitStatus;
use crate::replay::ReplayBuffer;

/// Outbound queue depth per client, in frames.
pub const CLIENT_QUEUE_FRAMES: usize = 256;

/// A handshake-complete client as the hub sees it.
pub struct ClientHandle {
    pub role: ClientType,
    pub tx: mpsc::Sender<Frame>,
    /// Cancelling this tears down the client's read and write tasks.
    pub cancel: CancellationToken,
}

/// Messages into the hub task.
pub enum HubMsg {
    /// A chunk read from the PTY master.
    Output(Bytes),
    /// A client finished HELLO/WELCOME and joins the broadcast set.
    Register { id: u64, handle: ClientHandle },
    /// A client's connection ended.
    Deregister { id: u64 },
    /// The child process terminated.
    ChildExit(ExitStatus),
    /// A (replacement) child came up; the previous exit is stale.
    ChildSpawned,
}

pub struct Hub {
    clients: HashMap<u64, ClientHandle>,
    replay: ReplayBuffer,
    tower: Option<u64>,
    /// Exit of the current (dead) child, replayed to late joiners so a
    /// reconnecting Tower observes the exit it missed.
    last_exit: Option<ExitStatus>,
}

impl Hub {
    pub fn new(replay_max_lines: usize) -> Self {
        Self {
            clients: HashMap::new(),
            replay: ReplayBuffer::new(replay_max_lines),
            tower: None,
            last_exit: None,
        }
    }

    /// Process messages until the channel closes or shutdown is signalled.
    /// On shutdown every client connection is cancelled.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HubMsg>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg),
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        for (_, client) in self.clients.drain() {
            client.cancel.cancel();
        }
    }

    fn handle(&mut self, msg: HubMsg) {
        match msg {
            HubMsg::Output(data) => {
                self.replay.push(&data);
                self.broadcast(Frame::Data(data));
            }
            HubMsg::Register { id, handle } => self.register(id, handle),
            HubMsg::Deregister { id } => {
                if let Some(client) = self.clients.remove(&id) {
                    client.cancel.cancel();
                }
                if self.tower == Some(id) {
                    self.tower = None;
                }
            }
            HubMsg::ChildExit(status) => {
                self.last_exit = Some(status);
                self.broadcast(Frame::Exit {
                    code: status.code,
                    signal: status.signal_name(),
                });
            }
            HubMsg::ChildSpawned => {
                self.last_exit = None;
            }
        }
    }

    fn register(&mut self, id: u64, handle: ClientHandle) {
        if handle.role == ClientType::Tower {
            // A new tower client displaces the previous one.
            if let Some(prev) = self.tower.take() {
                if let Some(old) = self.clients.remove(&prev) {
                    debug!(prev, next = id, "tower client displaced");
                    old.cancel.cancel();
                }
            }
            self.tower = Some(id);
        }

        // One REPLAY before any live DATA: the hub is a single task and the
        // client queue is FIFO, so ordering holds by construction.
        let snapshot = Bytes::from(self.replay.snapshot());
        if handle.tx.try_send(Frame::Replay(snapshot)).is_err() {
            warn!(id, "client queue full at replay, dropping");
            handle.cancel.cancel();
            if self.tower == Some(id) {
                self.tower = None;
            }
            return;
        }

        // A joiner that missed the child's death still observes it.
        if let Some(status) = self.last_exit {
            let _ = handle
                .tx
                .try_send(Frame::Exit { code: status.code, signal: status.signal_name() });
        }

        self.clients.insert(id, handle);
    }

    fn broadcast(&mut self, frame: Frame) {
        let mut dead = Vec::new();
        for (id, client) in &self.clients {
            if client.tx.try_send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!(id, "client send queue saturated, disconnecting");
            if let Some(client) = self.clients.remove(&id) {
                client.cancel.cancel();
            }
            if self.tower == Some(id) {
                self.tower = None;
            }
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
