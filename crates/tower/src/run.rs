// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ordered boot pipeline.
//!
//! The sequence below is safety-critical and must not be reordered:
//!
//! 1. Bind the listening socket. Terminal routes exist but are gated.
//! 2. Initialise the SessionManager and run one stale-socket sweep.
//! 3. Reconcile: rebind surviving sidecars, sweep dead descriptors. The
//!    manager's `reconciling` flag keeps every request-handler path from
//!    materialising sessions concurrently.
//! 4. Drop the flag: workspace APIs (including the WS upgrade) go live.
//! 5. Start the periodic tasks (stale sweep, send-buffer flusher).
//!
//! A dashboard poll landing between (2) and (3) must see 503, not an
//! opportunistic reconnect racing the sweep. The ordering alone is not
//! enough (handlers are already registered); the flag alone is not enough
//! (nothing would re-check it mid-pass). Both together are.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::manager::SessionManager;
use crate::registry::Registry;
use crate::sendbuf::SendBuffer;
use crate::transport::{build_router, Store};

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("TOWER_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the Tower server to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    config.validate()?;
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    // Only registry corruption and a failed bind are allowed to abort the
    // process; both happen before any session state exists.
    let registry = Registry::open(&config.registry_path()).await?;

    // 1. Bind first. Routes are served immediately but the reconcile gate
    //    answers 503 on every terminal route until step 4.
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("listening on {}", listener.local_addr()?);

    let (manager, events_rx) =
        SessionManager::new(Arc::clone(&config), registry, shutdown.clone());
    let sendbuf = Arc::new(SendBuffer::new(
        config.sendbuf_idle(),
        config.sendbuf_max_age(),
        config.sendbuf_flush(),
    ));
    let store = Arc::new(Store {
        manager: Arc::clone(&manager),
        sendbuf: Arc::clone(&sendbuf),
        config: Arc::clone(&config),
    });

    let router = build_router(store);
    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {e}");
        }
    });

    // Session events (exits, disconnects) are handled from here on,
    // including for sessions materialised by reconciliation.
    tokio::spawn(Arc::clone(&manager).run_events(events_rx));

    // 2. Initial stale-socket sweep.
    manager.sweep_stale_sockets().await;

    // 3. Reconciliation, under the gate.
    manager.reconcile().await;

    // 4. Open the workspace APIs.
    manager.set_reconciling(false);
    info!("workspace APIs enabled");

    // 5. Periodic tasks.
    tokio::spawn(Arc::clone(&manager).run_sweeper());
    {
        let lookup_manager = Arc::clone(&manager);
        tokio::spawn(Arc::clone(&sendbuf).run_flusher(
            move |id: &str| lookup_manager.get(id),
            shutdown.clone(),
        ));
    }

    spawn_signal_handler(shutdown.clone());

    shutdown.cancelled().await;
    info!("shutting down");

    // Asymmetric shutdown: sidecar-backed sessions survive; direct-PTY
    // sessions are terminated. The flusher's shutdown arm force-flushes
    // the send buffer.
    manager.shutdown_all().await;
    let _ = server.await;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        // First signal: graceful shutdown.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        // Second signal: force exit.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
