// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Restart survival: a sidecar-backed session outlives the Tower process
//! that created it, and a fresh Tower reconciles back onto it with a
//! working round-trip and replayed history.

use bytes::Bytes;
use tower_specs::{boot_tower, own_sidecar_record, read_until_contains, start_sidecar};

const ECHO_LOOP: &[&str] = &["/bin/sh", "-c", "while read line; do echo got:$line; done"];

#[tokio::test]
async fn session_survives_tower_restart_with_replay_and_round_trip() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");

    let socket = start_sidecar(socket_dir.path(), "s1", ECHO_LOOP).await;

    // Seed the registry as create_session would have.
    {
        let registry =
            towerd::registry::Registry::open(&data_dir.path().join("registry.db"))
                .await
                .expect("registry");
        registry
            .insert(&own_sidecar_record("s1", &socket, ECHO_LOOP))
            .await
            .expect("insert");
    }

    // First Tower life: reconcile onto the sidecar and do a round-trip.
    let tower1 = boot_tower(data_dir.path(), socket_dir.path(), &[]).await;
    let session = tower1.manager.get("s1").expect("session materialised");
    let mut att = session.attach(None);
    session.write(Bytes::from_static(b"hello\n"), true).await.expect("write");
    read_until_contains(&mut att.events, &[], "got:hello").await;

    // Tower "dies": drop the manager without any shutdown courtesy. The
    // sidecar keeps running.
    drop(att);
    drop(session);
    drop(tower1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // Second Tower life: reconciliation finds the descriptor, verifies the
    // sidecar identity, and reattaches.
    let tower2 = boot_tower(data_dir.path(), socket_dir.path(), &[]).await;
    let session = tower2.manager.get("s1").expect("session restored after restart");

    let mut att = session.attach(None);
    // The ring was re-seeded from the sidecar's REPLAY: earlier output is
    // visible without any live traffic.
    let replayed: Vec<u8> = att.replay.iter().flat_map(|c| c.data.to_vec()).collect();
    let history = read_until_contains(&mut att.events, &replayed, "got:hello").await;
    assert!(history.contains("got:hello"), "replay must cover pre-restart output");

    // And the session is live, not a husk.
    session.write(Bytes::from_static(b"world\n"), true).await.expect("write");
    read_until_contains(&mut att.events, &[], "got:world").await;

    // The registry row survived untouched.
    let record =
        tower2.manager.registry().get("s1").await.expect("get").expect("row present");
    assert!(record.is_sidecar_backed());
}
