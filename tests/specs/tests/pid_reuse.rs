// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pid-reuse defence: a descriptor whose pid now belongs to an unrelated
//! process must fail reconciliation on the start-time mismatch, and its
//! row is swept — while the (orphaned but live) sidecar is left alone.

use tower_specs::{boot_tower, sidecar_record_with_identity, start_sidecar};

#[tokio::test]
async fn recycled_pid_fails_reconnection_and_row_is_swept() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");

    // A perfectly healthy sidecar is listening...
    let socket = start_sidecar(socket_dir.path(), "victim", &["/bin/cat"]).await;

    // ...but the descriptor's pid points at an unrelated live process
    // (pid 1 exists everywhere) with a start time that cannot match.
    {
        let registry =
            towerd::registry::Registry::open(&data_dir.path().join("registry.db"))
                .await
                .expect("registry");
        registry
            .insert(&sidecar_record_with_identity(
                "victim",
                &socket,
                &["/bin/cat"],
                1,
                "123456",
            ))
            .await
            .expect("insert");
    }

    let tower = boot_tower(data_dir.path(), socket_dir.path(), &[]).await;

    // The session failed to materialise and the descriptor was swept.
    assert!(tower.manager.get("victim").is_none());
    assert!(tower
        .manager
        .registry()
        .get("victim")
        .await
        .expect("get")
        .is_none());

    // The orphan sidecar itself was not terminated: its socket still
    // answers a handshake.
    let mut stream = tokio::net::UnixStream::connect(&socket).await.expect("still listening");
    tower_sidecar::frame::write_frame(
        &mut stream,
        &tower_sidecar::frame::Frame::Hello {
            version: 1,
            client_type: tower_sidecar::frame::ClientType::Terminal,
        },
    )
    .await
    .expect("hello");
    let frame = tower_sidecar::frame::read_frame(&mut stream)
        .await
        .expect("read")
        .expect("frame");
    assert!(matches!(frame, tower_sidecar::frame::Frame::Welcome { .. }));
}

#[tokio::test]
async fn dead_pid_descriptor_is_swept() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");

    let socket = socket_dir.path().join("gone.sock");
    {
        let registry =
            towerd::registry::Registry::open(&data_dir.path().join("registry.db"))
                .await
                .expect("registry");
        registry
            .insert(&sidecar_record_with_identity(
                "gone",
                &socket,
                &["/bin/cat"],
                u32::MAX - 11,
                "1700000000",
            ))
            .await
            .expect("insert");
    }

    let tower = boot_tower(data_dir.path(), socket_dir.path(), &[]).await;
    assert!(tower.manager.get("gone").is_none());
    assert!(tower.manager.registry().get("gone").await.expect("get").is_none());
}
