// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

async fn open_temp() -> (tempfile::TempDir, Registry) {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::open(&dir.path().join("registry.db")).await.expect("open");
    (dir, registry)
}

fn sidecar_record(id: &str) -> SessionRecord {
    SessionRecord {
        session_id: id.to_owned(),
        workspace_key: "ws-1".to_owned(),
        role: "shell".to_owned(),
        socket_path: format!("/tmp/tower-test/{id}.sock"),
        sidecar_pid: 4321,
        sidecar_start_time: "1700000000".to_owned(),
        cmd: "/bin/sh".to_owned(),
        args: r#"["-l"]"#.to_owned(),
        cwd: "/home".to_owned(),
        env: r#"{"LANG":"C.UTF-8"}"#.to_owned(),
        cols: 80,
        rows: 24,
        created_at: 1700000001,
        supervised: false,
        persistent: true,
    }
}

fn direct_record(id: &str) -> SessionRecord {
    SessionRecord {
        socket_path: String::new(),
        sidecar_pid: 0,
        sidecar_start_time: String::new(),
        persistent: false,
        ..sidecar_record(id)
    }
}

#[tokio::test]
async fn migrations_apply_once() {
    let (dir, registry) = open_temp().await;
    assert_eq!(registry.schema_version().await.expect("version"), 2);

    // Re-opening the same file is a no-op migration-wise.
    drop(registry);
    let reopened = Registry::open(&dir.path().join("registry.db")).await.expect("reopen");
    assert_eq!(reopened.schema_version().await.expect("version"), 2);
}

#[tokio::test]
async fn insert_get_roundtrip() {
    let (_dir, registry) = open_temp().await;
    let record = sidecar_record("s1");
    registry.insert(&record).await.expect("insert");

    let loaded = registry.get("s1").await.expect("get").expect("present");
    assert_eq!(loaded, record);
    assert!(loaded.is_sidecar_backed());
    assert_eq!(loaded.args_vec(), vec!["-l"]);
    assert_eq!(loaded.env_map().get("LANG").map(String::as_str), Some("C.UTF-8"));
    assert_eq!(loaded.spawn_spec().cmd, "/bin/sh");
}

#[tokio::test]
async fn get_missing_is_none() {
    let (_dir, registry) = open_temp().await;
    assert!(registry.get("nope").await.expect("get").is_none());
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let (_dir, registry) = open_temp().await;
    registry.insert(&sidecar_record("dup")).await.expect("insert");
    assert!(registry.insert(&sidecar_record("dup")).await.is_err());
}

#[tokio::test]
async fn mixed_identity_fields_are_rejected() {
    let (_dir, registry) = open_temp().await;
    let mut record = sidecar_record("bad");
    record.sidecar_start_time = String::new();
    assert!(registry.insert(&record).await.is_err());

    let mut record = direct_record("bad2");
    record.sidecar_pid = 99;
    assert!(registry.insert(&record).await.is_err());
}

#[tokio::test]
async fn list_filters_by_workspace() {
    let (_dir, registry) = open_temp().await;
    registry.insert(&sidecar_record("a")).await.expect("insert");
    let mut other = sidecar_record("b");
    other.workspace_key = "ws-2".to_owned();
    registry.insert(&other).await.expect("insert");

    assert_eq!(registry.list(None).await.expect("list").len(), 2);
    let scoped = registry.list(Some("ws-2")).await.expect("list");
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].session_id, "b");
}

#[tokio::test]
async fn sidecar_backed_and_direct_pty_partition_rows() {
    let (_dir, registry) = open_temp().await;
    registry.insert(&sidecar_record("side")).await.expect("insert");
    registry.insert(&direct_record("direct")).await.expect("insert");

    let sidecars = registry.sidecar_backed().await.expect("query");
    assert_eq!(sidecars.len(), 1);
    assert_eq!(sidecars[0].session_id, "side");

    let direct = registry.direct_pty().await.expect("query");
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].session_id, "direct");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_dir, registry) = open_temp().await;
    registry.insert(&sidecar_record("gone")).await.expect("insert");
    assert!(registry.delete("gone").await.expect("delete"));
    assert!(!registry.delete("gone").await.expect("delete again"));
    assert!(registry.get("gone").await.expect("get").is_none());
}

#[tokio::test]
async fn update_dims_persists() {
    let (_dir, registry) = open_temp().await;
    registry.insert(&sidecar_record("resize")).await.expect("insert");
    registry.update_dims("resize", 132, 50).await.expect("update");

    let loaded = registry.get("resize").await.expect("get").expect("present");
    assert_eq!((loaded.cols, loaded.rows), (132, 50));
}

#[tokio::test]
async fn rows_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.db");
    {
        let registry = Registry::open(&path).await.expect("open");
        registry.insert(&sidecar_record("durable")).await.expect("insert");
    }
    let registry = Registry::open(&path).await.expect("reopen");
    let loaded = registry.get("durable").await.expect("get").expect("present");
    assert_eq!(loaded.session_id, "durable");
}
