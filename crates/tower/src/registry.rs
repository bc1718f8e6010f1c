// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable session registry.
//!
//! One SQLite file, one table, one row per session descriptor. This store
//! exists only for restart survival: the in-memory session table is the
//! runtime source of truth, and nothing here drives lifetime decisions on
//! its own.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use tower_sidecar::frame::SpawnSpec;

use crate::error::{err, ErrorKind};

/// Numbered, linear schema migrations. `PRAGMA user_version` records how
/// many have been applied; new steps are appended, never edited.
const MIGRATIONS: &[&str] = &[
    // 1: initial descriptor table
    r#"
    CREATE TABLE sessions (
        session_id TEXT PRIMARY KEY,
        workspace_key TEXT NOT NULL,
        role TEXT NOT NULL,
        socket_path TEXT NOT NULL DEFAULT '',
        sidecar_pid INTEGER NOT NULL DEFAULT 0,
        sidecar_start_time TEXT NOT NULL DEFAULT '',
        cmd TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '[]',
        cwd TEXT NOT NULL DEFAULT '',
        env TEXT NOT NULL DEFAULT '{}',
        cols INTEGER NOT NULL,
        rows INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        supervised INTEGER NOT NULL DEFAULT 0,
        persistent INTEGER NOT NULL DEFAULT 0
    )
    "#,
    // 2: workspace scoping queries
    "CREATE INDEX idx_sessions_workspace ON sessions(workspace_key)",
];

/// One descriptor row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub workspace_key: String,
    pub role: String,
    pub socket_path: String,
    pub sidecar_pid: i64,
    pub sidecar_start_time: String,
    pub cmd: String,
    /// JSON array of strings.
    pub args: String,
    pub cwd: String,
    /// JSON object of string → string.
    pub env: String,
    pub cols: i64,
    pub rows: i64,
    pub created_at: i64,
    pub supervised: bool,
    pub persistent: bool,
}

impl SessionRecord {
    pub fn is_sidecar_backed(&self) -> bool {
        !self.socket_path.is_empty()
    }

    pub fn args_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.args).unwrap_or_default()
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env).unwrap_or_default()
    }

    /// The spawn parameters used to (re)launch the child in the sidecar.
    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            cmd: self.cmd.clone(),
            args: self.args_vec(),
            cwd: self.cwd.clone(),
            env: self.env_map(),
        }
    }

    /// Backend identity fields are all empty (direct PTY) or all populated
    /// (sidecar-backed); anything else is a corrupt descriptor.
    pub fn validate(&self) -> anyhow::Result<()> {
        let has_socket = !self.socket_path.is_empty();
        let has_pid = self.sidecar_pid != 0;
        let has_start = !self.sidecar_start_time.is_empty();
        if has_socket != has_pid || has_pid != has_start {
            return err(
                ErrorKind::ConfigInvalid,
                format!(
                    "descriptor {} mixes sidecar identity fields (socket={has_socket}, pid={has_pid}, start_time={has_start})",
                    self.session_id
                ),
            );
        }
        if self.cmd.is_empty() {
            return err(ErrorKind::ConfigInvalid, "descriptor has no command");
        }
        Ok(())
    }
}

/// Handle to the SQLite descriptor store. Single writer by construction:
/// all mutations go through the SessionManager, which owns this handle.
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open (creating if missing) and migrate the registry file.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("create registry directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("open session registry")?;

        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let row = sqlx::query("PRAGMA user_version").fetch_one(&self.pool).await?;
        let version: i64 = row.try_get(0)?;

        for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("apply migration {}", index + 1))?;
            sqlx::query(&format!("PRAGMA user_version = {}", index + 1))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Applied schema version, for diagnostics.
    pub async fn schema_version(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("PRAGMA user_version").fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    pub async fn insert(&self, record: &SessionRecord) -> anyhow::Result<()> {
        record.validate()?;
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, workspace_key, role, socket_path, sidecar_pid,
                sidecar_start_time, cmd, args, cwd, env, cols, rows,
                created_at, supervised, persistent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.workspace_key)
        .bind(&record.role)
        .bind(&record.socket_path)
        .bind(record.sidecar_pid)
        .bind(&record.sidecar_start_time)
        .bind(&record.cmd)
        .bind(&record.args)
        .bind(&record.cwd)
        .bind(&record.env)
        .bind(record.cols)
        .bind(record.rows)
        .bind(record.created_at)
        .bind(record.supervised)
        .bind(record.persistent)
        .execute(&self.pool)
        .await
        .context("insert session descriptor")?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list(&self, workspace_key: Option<&str>) -> anyhow::Result<Vec<SessionRecord>> {
        let records = match workspace_key {
            Some(key) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM sessions WHERE workspace_key = ? ORDER BY created_at",
                )
                .bind(key)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(records)
    }

    /// Rows that reference a sidecar — the reconciliation input set.
    pub async fn sidecar_backed(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions WHERE socket_path != '' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Direct-PTY rows. These never survive a restart; startup deletes them.
    pub async fn direct_pty(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions WHERE socket_path = '' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn delete(&self, session_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_dims(&self, session_id: &str, cols: u16, rows: u16) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET cols = ?, rows = ? WHERE session_id = ?")
            .bind(cols as i64)
            .bind(rows as i64)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
