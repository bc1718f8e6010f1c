// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup reconciliation: rebind to surviving sidecars, sweep orphan
//! descriptors.
//!
//! Runs once, before any workspace API can surface session lists, with the
//! manager's `reconciling` flag up. Bounded concurrency keeps a registry
//! full of dead sessions from amplifying into a synchronous stampede of
//! connect timeouts.

use std::path::Path;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::backend::sidecar::SidecarBackend;
use crate::error::{err, ErrorKind};
use crate::manager::SessionManager;
use crate::procinfo;
use crate::registry::SessionRecord;
use crate::roles::Role;
use crate::session::{Session, SessionMeta};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconnected: usize,
    pub swept: usize,
    /// Rows that failed reconnection but whose sidecar still looks alive;
    /// kept for a future pass.
    pub kept: usize,
}

impl SessionManager {
    /// Rebind one descriptor row to its surviving sidecar.
    ///
    /// Fails with `SidecarUnreachable` when the pid is dead, the start time
    /// does not match (pid reuse), or the socket does not answer in time.
    pub async fn reconnect_session(&self, record: &SessionRecord) -> anyhow::Result<Arc<Session>> {
        record.validate()?;
        if !record.is_sidecar_backed() {
            return err(
                ErrorKind::SidecarUnreachable,
                format!("session {} is not sidecar-backed", record.session_id),
            );
        }

        let pid = record.sidecar_pid as u32;
        if !procinfo::identity_matches(pid, &record.sidecar_start_time) {
            return err(
                ErrorKind::SidecarUnreachable,
                format!(
                    "sidecar pid {pid} is dead or recycled (recorded start {})",
                    record.sidecar_start_time
                ),
            );
        }

        let (backend, _welcome) = SidecarBackend::connect(
            Path::new(&record.socket_path),
            self.config().connect_timeout(),
            self.config().kill_grace(),
        )
        .await?;

        let role: Role = record
            .role
            .parse()
            .map_err(|e: String| crate::error::TowerError::new(ErrorKind::ConfigInvalid, e))?;
        let meta = SessionMeta {
            id: record.session_id.clone(),
            workspace_key: record.workspace_key.clone(),
            role,
            supervised: record.supervised,
            persistent: true,
            created_at: record.created_at,
            spec: record.spawn_spec(),
        };

        let session = Session::spawn(
            meta,
            backend,
            record.cols as u16,
            record.rows as u16,
            self.config().ring_lines,
            self.termlog_for(&record.session_id),
            self.events_sender(),
        );
        self.insert(Arc::clone(&session));
        Ok(session)
    }

    /// The full startup pass over every sidecar-backed row.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Direct-PTY rows cannot survive a restart by definition.
        if let Ok(rows) = self.registry().direct_pty().await {
            for row in rows {
                let _ = self.registry().delete(&row.session_id).await;
                report.swept += 1;
            }
        }

        let rows = match self.registry().sidecar_backed().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("reconciliation could not read the registry: {e:#}");
                return report;
            }
        };
        if rows.is_empty() {
            info!("reconciliation: no sidecar-backed descriptors");
            return report;
        }

        let concurrency = self.config().reconcile_concurrency.max(1);
        let outcomes: Vec<(SessionRecord, anyhow::Result<Arc<Session>>)> =
            stream::iter(rows.into_iter().map(|record| async move {
                let result = self.reconnect_session(&record).await;
                (record, result)
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        // Sweep pass: a failed row is deleted only once its recorded
        // sidecar identity is verifiably gone. A live orphan sidecar is
        // never terminated here — a future startup may still reconnect it.
        for (record, result) in outcomes {
            match result {
                Ok(_) => {
                    report.reconnected += 1;
                    info!(session = %record.session_id, "reconnected to surviving sidecar");
                }
                Err(e) => {
                    warn!(session = %record.session_id, "reconnection failed: {e:#}");
                    let alive = procinfo::identity_matches(
                        record.sidecar_pid as u32,
                        &record.sidecar_start_time,
                    );
                    if alive {
                        report.kept += 1;
                    } else {
                        // Row only; the socket file is the probing sweep's
                        // business (it may belong to a live orphan sidecar
                        // this descriptor merely mis-identified).
                        let _ = self.registry().delete(&record.session_id).await;
                        report.swept += 1;
                    }
                }
            }
        }

        info!(
            reconnected = report.reconnected,
            swept = report.swept,
            kept = report.kept,
            "reconciliation complete"
        );
        report
    }
}
