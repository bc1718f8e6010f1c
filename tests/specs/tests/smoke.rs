// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary smoke test: spawn the real `towerd` and poke its HTTP surface.
//! Skipped when the binary has not been built (e.g. `cargo test -p`).

use std::time::Duration;

use tower_specs::{http_get, towerd_binary, WAIT};

fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[tokio::test]
async fn healthz_and_gated_terminals_come_up() {
    let Some(binary) = towerd_binary() else {
        eprintln!("skipping: towerd binary not built");
        return;
    };

    let data_dir = tempfile::tempdir().expect("tempdir");
    let socket_dir = tempfile::tempdir().expect("tempdir");
    let port = free_port().expect("free port");
    let addr = format!("127.0.0.1:{port}");

    struct KillOnDrop(std::process::Child);
    impl Drop for KillOnDrop {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    let child = std::process::Command::new(binary)
        .args([
            "--host",
            "127.0.0.1",
            "--port",
            &port.to_string(),
            "--data-dir",
            &data_dir.path().to_string_lossy(),
            "--socket-dir-override",
            &socket_dir.path().to_string_lossy(),
            "--log-format",
            "text",
        ])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("spawn towerd");
    let _guard = KillOnDrop(child);

    // Health comes up first and reports reconciliation state.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(tokio::time::Instant::now() < deadline, "healthz never answered");
        if let Ok((status, body)) = http_get(&addr, "/healthz").await {
            if status.contains("200") && body.contains("\"status\":\"ok\"") {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // With an empty registry, reconciliation finishes almost at once and
    // the terminal listing opens up.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(tokio::time::Instant::now() < deadline, "terminals never opened");
        if let Ok((status, body)) = http_get(&addr, "/terminals").await {
            if status.contains("200") {
                assert!(body.contains("\"terminals\""));
                break;
            }
            // 503 NOT_READY is the only acceptable interim answer.
            assert!(status.contains("503"), "unexpected pre-reconcile status: {status}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (status, _body) = http_get(&addr, "/terminals/ghost").await.expect("get");
    assert!(status.contains("404"));
}
