// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    config = { ErrorKind::ConfigInvalid, 400, "CONFIG_INVALID" },
    spawn = { ErrorKind::SidecarSpawnFailed, 502, "SIDECAR_SPAWN_FAILED" },
    unreachable = { ErrorKind::SidecarUnreachable, 502, "SIDECAR_UNREACHABLE" },
    protocol = { ErrorKind::SidecarProtocolError, 502, "SIDECAR_PROTOCOL_ERROR" },
    overflow = { ErrorKind::SubscriberOverflow, 409, "SUBSCRIBER_OVERFLOW" },
    exited = { ErrorKind::ChildExited, 410, "CHILD_EXITED" },
    exhausted = { ErrorKind::SupervisionExhausted, 410, "SUPERVISION_EXHAUSTED" },
    shutdown = { ErrorKind::Shutdown, 503, "SHUTDOWN" },
    not_ready = { ErrorKind::NotReady, 503, "NOT_READY" },
    not_found = { ErrorKind::NotFound, 404, "NOT_FOUND" },
    internal = { ErrorKind::Internal, 500, "INTERNAL" },
)]
fn kind_mapping(kind: ErrorKind, status: u16, code: &str) {
    assert_eq!(kind.http_status(), status);
    assert_eq!(kind.as_str(), code);
    assert_eq!(kind.to_string(), code);
}

#[test]
fn tower_error_display_includes_kind_and_message() {
    let e = TowerError::new(ErrorKind::SidecarSpawnFailed, "announce timed out");
    assert_eq!(e.to_string(), "SIDECAR_SPAWN_FAILED: announce timed out");
}

#[test]
fn kind_of_recovers_structured_kind_through_anyhow() {
    let e: anyhow::Error = TowerError::new(ErrorKind::NotFound, "no such session").into();
    assert_eq!(kind_of(&e), ErrorKind::NotFound);
}

#[test]
fn kind_of_defaults_to_internal() {
    let e = anyhow::anyhow!("plain error");
    assert_eq!(kind_of(&e), ErrorKind::Internal);
}

#[test]
fn err_helper_produces_downcastable_error() {
    let result: anyhow::Result<()> = err(ErrorKind::Shutdown, "stopping");
    let e = result.err().map(|e| kind_of(&e));
    assert_eq!(e, Some(ErrorKind::Shutdown));
}
