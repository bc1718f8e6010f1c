// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervised auto-restart: an EXIT from the sidecar triggers a SPAWN of
//! the original command after back-off, inside the same sidecar; once the
//! cap is hit the session is marked dead and no further SPAWN is issued.

use std::time::Duration;

use towerd::session::SubscriberEvent;
use tower_specs::{boot_tower, spawn_decoy, start_sidecar, WAIT};

const SHORT_LIVED: &[&str] = &["/bin/sh", "-c", "echo marker; exit 0"];

#[tokio::test]
async fn child_is_respawned_inside_the_same_sidecar() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");

    let socket = start_sidecar(socket_dir.path(), "sup", SHORT_LIVED).await;
    let (mut decoy, pid, start) = spawn_decoy().expect("decoy");

    {
        let registry =
            towerd::registry::Registry::open(&data_dir.path().join("registry.db"))
                .await
                .expect("registry");
        let mut record = tower_specs::sidecar_record_with_identity(
            "sup",
            &socket,
            SHORT_LIVED,
            pid,
            &start,
        );
        record.supervised = true;
        registry.insert(&record).await.expect("insert");
    }

    let mut tower = boot_tower(
        data_dir.path(),
        socket_dir.path(),
        &["--restart-backoff-secs", "0"],
    )
    .await;
    let events_rx = tower.events_rx.take().expect("events");
    tokio::spawn(std::sync::Arc::clone(&tower.manager).run_events(events_rx));

    let session = tower.manager.get("sup").expect("session");
    let mut att = session.attach(None);
    let replayed: Vec<u8> = att.replay.iter().flat_map(|c| c.data.to_vec()).collect();

    // "marker" appears again after the supervised respawn: at least two
    // occurrences total proves a second child ran.
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut seen = String::from_utf8_lossy(&replayed).into_owned();
    while seen.matches("marker").count() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never saw a respawned child: {seen:?}"
        );
        match tokio::time::timeout(WAIT, att.events.recv()).await {
            Ok(Some(SubscriberEvent::Data(chunk))) => {
                seen.push_str(&String::from_utf8_lossy(&chunk.data));
            }
            Ok(Some(SubscriberEvent::Exit(_))) => {}
            other => panic!("subscriber stream ended early: {other:?}"),
        }
    }

    let _ = decoy.kill();
    let _ = decoy.wait();
}

#[tokio::test]
async fn exhausted_supervision_marks_the_session_dead() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");

    let socket = start_sidecar(socket_dir.path(), "exh", SHORT_LIVED).await;
    let (mut decoy, pid, start) = spawn_decoy().expect("decoy");

    {
        let registry =
            towerd::registry::Registry::open(&data_dir.path().join("registry.db"))
                .await
                .expect("registry");
        let mut record = tower_specs::sidecar_record_with_identity(
            "exh",
            &socket,
            SHORT_LIVED,
            pid,
            &start,
        );
        record.supervised = true;
        registry.insert(&record).await.expect("insert");
    }

    let mut tower = boot_tower(
        data_dir.path(),
        socket_dir.path(),
        &["--restart-backoff-secs", "0", "--max-restarts", "1"],
    )
    .await;
    let events_rx = tower.events_rx.take().expect("events");
    tokio::spawn(std::sync::Arc::clone(&tower.manager).run_events(events_rx));

    // One restart is allowed; the second exit exhausts supervision and the
    // session is removed from the table and the registry.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let gone_from_table = tower.manager.get("exh").is_none();
        let gone_from_registry =
            tower.manager.registry().get("exh").await.expect("get").is_none();
        if gone_from_table && gone_from_registry {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "supervision was never exhausted (table={gone_from_table}, registry={gone_from_registry})"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = decoy.kill();
    let _ = decoy.wait();
}
