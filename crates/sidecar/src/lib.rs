// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tower sidecar: a detached helper process that owns one PTY and serves
//! its I/O over a framed Unix socket, decoupling the child's lifetime from
//! the Tower server's.

pub mod announce;
pub mod config;
pub mod frame;
pub mod hub;
pub mod pty;
pub mod replay;
pub mod server;
