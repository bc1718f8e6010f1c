// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy shared across the terminal substrate and its HTTP edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed spawn parameters, invalid dims, unknown signal name.
    ConfigInvalid,
    /// Sidecar could not be detached, announce line absent or malformed.
    SidecarSpawnFailed,
    /// Reconnect found the sidecar pid dead or its start time changed.
    SidecarUnreachable,
    /// Oversized or malformed frame on a sidecar connection.
    SidecarProtocolError,
    /// A subscriber's outbound queue saturated.
    SubscriberOverflow,
    /// The child exited (terminal event for unsupervised sessions).
    ChildExited,
    /// Supervised restart counter exceeded its cap.
    SupervisionExhausted,
    /// Operation observed Tower shutting down.
    Shutdown,
    /// Reconciliation has not completed yet; workspace APIs are gated.
    NotReady,
    /// No session with the requested id.
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ConfigInvalid => 400,
            Self::SidecarSpawnFailed => 502,
            Self::SidecarUnreachable => 502,
            Self::SidecarProtocolError => 502,
            Self::SubscriberOverflow => 409,
            Self::ChildExited => 410,
            Self::SupervisionExhausted => 410,
            Self::Shutdown => 503,
            Self::NotReady => 503,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::SidecarSpawnFailed => "SIDECAR_SPAWN_FAILED",
            Self::SidecarUnreachable => "SIDECAR_UNREACHABLE",
            Self::SidecarProtocolError => "SIDECAR_PROTOCOL_ERROR",
            Self::SubscriberOverflow => "SUBSCRIBER_OVERFLOW",
            Self::ChildExited => "CHILD_EXITED",
            Self::SupervisionExhausted => "SUPERVISION_EXHAUSTED",
            Self::Shutdown => "SHUTDOWN",
            Self::NotReady => "NOT_READY",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured substrate error: a taxonomy kind plus human detail.
#[derive(Debug, Clone)]
pub struct TowerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TowerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for TowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for TowerError {}

/// Shorthand for `Err(TowerError { kind, .. })` as `anyhow::Error`.
pub fn err<T>(kind: ErrorKind, message: impl Into<String>) -> anyhow::Result<T> {
    Err(TowerError::new(kind, message).into())
}

/// Classify an `anyhow::Error` for the HTTP edge. Errors that are not a
/// [`TowerError`] map to `Internal`.
pub fn kind_of(error: &anyhow::Error) -> ErrorKind {
    error.downcast_ref::<TowerError>().map(|e| e.kind).unwrap_or(ErrorKind::Internal)
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
